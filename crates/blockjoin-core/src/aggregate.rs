use parking_lot::Mutex;

use crate::relation::JoinedRow;

#[derive(Debug, Default)]
struct Merged {
    rows: Vec<JoinedRow>,
    merges: usize,
}

/// Global output sequence that concurrent contributors append to.
///
/// Each [`merge`](Self::merge) is one critical section: a contribution lands
/// whole and contiguous, never interleaved with another one.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    inner: Mutex<Merged>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Merged {
                rows: Vec::with_capacity(capacity),
                merges: 0,
            }),
        }
    }

    pub fn merge(&self, partial: Vec<JoinedRow>) {
        let mut merged = self.inner.lock();
        merged.rows.extend(partial);
        merged.merges += 1;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of merge events so far, including empty contributions.
    pub fn merges(&self) -> usize {
        self.inner.lock().merges
    }

    pub fn into_rows(self) -> Vec<JoinedRow> {
        self.inner.into_inner().rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn row(outer_key: i64, inner_id: i64) -> JoinedRow {
        JoinedRow {
            outer_key,
            outer_payload: format!("c{outer_key}"),
            inner_id,
            inner_payload: String::new(),
        }
    }

    #[test]
    fn merge_appends_in_contribution_order() {
        let agg = ResultAggregator::new();
        agg.merge(vec![row(1, 10), row(1, 11)]);
        agg.merge(Vec::new());
        agg.merge(vec![row(2, 20)]);

        assert_eq!(agg.len(), 3);
        assert_eq!(agg.merges(), 3);
        assert_eq!(agg.into_rows(), vec![row(1, 10), row(1, 11), row(2, 20)]);
    }

    #[test]
    fn concurrent_contributors_lose_nothing() {
        let agg = ResultAggregator::with_capacity(8 * 500);
        std::thread::scope(|s| {
            for worker in 0..8i64 {
                let agg = &agg;
                s.spawn(move || {
                    for chunk in 0..5i64 {
                        let partial = (0..100i64)
                            .map(|i| row(worker, chunk * 100 + i))
                            .collect();
                        agg.merge(partial);
                    }
                });
            }
        });

        assert_eq!(agg.merges(), 40);
        let rows = agg.into_rows();
        assert_eq!(rows.len(), 4000);
        let distinct: HashSet<_> = rows.iter().map(|r| (r.outer_key, r.inner_id)).collect();
        assert_eq!(distinct.len(), 4000);

        // Each contribution stays contiguous and in its own order.
        for window in rows.chunks(100) {
            let ids: Vec<i64> = window.iter().map(|r| r.inner_id).collect();
            assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
            assert!(window.iter().all(|r| r.outer_key == window[0].outer_key));
        }
    }
}
