use mcf_core::{RunCounts, RunStatus};
use mcf_storage::{ListingUpsert, PostUpsert, Store, StoreError};

/// Counters for one scrape run, held in memory until the run is finalized.
///
/// `complete` consumes the tracker, so a run is written back at most once.
#[derive(Debug)]
pub struct RunTracker {
    run_id: i64,
    counts: RunCounts,
    price_changes: u64,
}

impl RunTracker {
    pub async fn start(store: &dyn Store) -> Result<Self, StoreError> {
        let run_id = store.start_run().await?;
        Ok(Self {
            run_id,
            counts: RunCounts::default(),
            price_changes: 0,
        })
    }

    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn price_changes(&self) -> u64 {
        self.price_changes
    }

    pub fn record_source(&mut self) {
        self.counts.urls_processed += 1;
    }

    pub fn record_error(&mut self) {
        self.counts.errors += 1;
    }

    pub fn record_listing(&mut self, upsert: &ListingUpsert) {
        self.counts.listings_found += 1;
        if upsert.is_new {
            self.counts.new_listings += 1;
        }
        if upsert.has_price_change {
            self.price_changes += 1;
        }
    }

    pub fn record_post(&mut self, upsert: &PostUpsert) {
        self.counts.posts_found += 1;
        if upsert.is_new {
            self.counts.new_posts += 1;
        }
    }

    pub async fn complete(
        self,
        store: &dyn Store,
        status: RunStatus,
    ) -> Result<RunCounts, StoreError> {
        store.complete_run(self.run_id, &self.counts, status).await?;
        Ok(self.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcf_core::ListingStatus;
    use mcf_storage::SqliteStore;

    fn listing(is_new: bool, has_price_change: bool) -> ListingUpsert {
        ListingUpsert {
            id: "abc".to_string(),
            is_new,
            has_price_change,
            status: if has_price_change {
                ListingStatus::PriceChange
            } else {
                ListingStatus::Active
            },
        }
    }

    #[tokio::test]
    async fn counters_are_written_once_at_completion() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut tracker = RunTracker::start(&store).await.unwrap();
        let run_id = tracker.run_id();

        tracker.record_source();
        tracker.record_source();
        tracker.record_error();
        tracker.record_listing(&listing(true, false));
        tracker.record_listing(&listing(false, true));
        tracker.record_post(&PostUpsert {
            id: "p".to_string(),
            is_new: false,
        });
        assert_eq!(tracker.price_changes(), 1);

        let mid_run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(mid_run.counts, RunCounts::default());
        assert_eq!(mid_run.status, RunStatus::Running);

        let counts = tracker.complete(&store, RunStatus::Completed).await.unwrap();
        assert_eq!(counts.urls_processed, 2);
        assert_eq!(counts.listings_found, 2);
        assert_eq!(counts.new_listings, 1);
        assert_eq!(counts.posts_found, 1);
        assert_eq!(counts.new_posts, 0);
        assert_eq!(counts.errors, 1);

        let done = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(done.counts, counts);
        assert_eq!(done.status, RunStatus::Completed);
    }
}
