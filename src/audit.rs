use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    merge::{segment_key, SegmentKey},
    store::{SegmentStore, StoreError},
};

/// Two consecutive stored segments further apart than one interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub start: i64,
    pub end: i64,
}

impl Gap {
    pub fn delta(&self) -> i64 {
        self.end - self.start
    }

    /// Ids strictly between the two boundary segments.
    pub fn missing_range(&self) -> (i64, i64) {
        (self.start + 1, self.end - 1)
    }
}

/// Consecutive pairs of `ids` (sorted ascending) with their delta.
fn pairs(ids: &[i64]) -> impl Iterator<Item = Gap> + '_ {
    ids.windows(2).map(|w| Gap {
        start: w[0],
        end: w[1],
    })
}

/// The largest delta between consecutive `ids` if it exceeds
/// `nominal * (1 + tolerance)`. On equal deltas the earliest pair is
/// reported.
pub fn audit(ids: &[i64], nominal: i64, tolerance: f64) -> Option<Gap> {
    let worst = pairs(ids).fold(None, |worst: Option<Gap>, g| match worst {
        Some(w) if w.delta() >= g.delta() => worst,
        _ => Some(g),
    })?;

    (worst.delta() as f64 > nominal as f64 * (1.0 + tolerance)).then_some(worst)
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub segments: usize,
    /// How often each delta occurs, by delta.
    pub delta_counts: BTreeMap<i64, usize>,
    pub largest: Option<Gap>,
    pub smallest: Option<Gap>,
    /// Set when reconstruction is likely incomplete.
    pub gap: Option<Gap>,
}

impl AuditReport {
    pub fn new(ids: &[i64], nominal: i64, tolerance: f64) -> Self {
        let mut delta_counts = BTreeMap::new();
        for g in pairs(ids) {
            *delta_counts.entry(g.delta()).or_insert(0) += 1;
        }

        Self {
            segments: ids.len(),
            delta_counts,
            largest: pairs(ids).fold(None, |acc: Option<Gap>, g| match acc {
                Some(a) if a.delta() >= g.delta() => acc,
                _ => Some(g),
            }),
            smallest: pairs(ids).fold(None, |acc: Option<Gap>, g| match acc {
                Some(a) if a.delta() <= g.delta() => acc,
                _ => Some(g),
            }),
            gap: audit(ids, nominal, tolerance),
        }
    }

    pub fn log(&self) {
        info!("{} segments on disk", self.segments);
        let counts: Vec<String> = self
            .delta_counts
            .iter()
            .map(|(d, n)| format!("{}: {}", d, n))
            .collect();
        info!("Count of deltas between segments: {{{}}}", counts.join(", "));

        match self.gap {
            Some(gap) => {
                if let Some(l) = self.largest {
                    warn!("Largest delta {} between {} and {}", l.delta(), l.start, l.end);
                }
                if let Some(s) = self.smallest {
                    warn!("Smallest delta {} between {} and {}", s.delta(), s.start, s.end);
                }
                warn!(
                    "The recording is likely incomplete, worst gap is {} -> {}",
                    gap.start, gap.end
                );
            }
            None => info!("No missing segment found"),
        }
    }
}

/// Sorted ids of every numbered segment stored for a track.
pub async fn stored_ids(store: &SegmentStore) -> Result<Vec<i64>, StoreError> {
    let mut ids: Vec<i64> = store
        .files()
        .await?
        .iter()
        .filter_map(|p| match segment_key(p) {
            Some(SegmentKey::Id(id)) => Some(id),
            _ => None,
        })
        .collect();
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

pub async fn audit_store(
    store: &SegmentStore,
    nominal: i64,
    tolerance: f64,
) -> Result<AuditReport, StoreError> {
    let ids = stored_ids(store).await?;
    Ok(AuditReport::new(&ids, nominal, tolerance))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::{
        tests::{video_store, FakeFetcher},
        MemoryStorage,
    };

    #[test]
    fn no_gap_iff_all_deltas_within_tolerance() {
        let sequences: Vec<Vec<i64>> = vec![
            vec![],
            vec![1000],
            vec![0, 2000, 4000, 6000],
            vec![0, 2000, 4200, 6200],
            vec![0, 2000, 4201, 6201],
            vec![0, 1999, 4000, 5999, 8000],
            vec![0, 4000, 6000],
            vec![0, 2000, 2100, 9000],
            vec![10, 2043, 4010, 6010, 8111],
        ];

        for ids in sequences {
            let within = ids.windows(2).all(|w| (w[1] - w[0]) as f64 <= 2000.0 * 1.1);
            assert_eq!(audit(&ids, 2000, 0.1).is_none(), within, "{:?}", ids);
        }
    }

    #[test]
    fn reports_worst_gap() {
        let ids = [0, 2000, 6000, 8000, 14000, 16000];
        let gap = audit(&ids, 2000, 0.1).unwrap();
        assert_eq!(gap, Gap { start: 8000, end: 14000 });
        assert_eq!(gap.missing_range(), (8001, 13999));

        // Equal deltas: earliest wins.
        let gap = audit(&[0, 6000, 12000], 2000, 0.1).unwrap();
        assert_eq!(gap.start, 0);
    }

    #[test]
    fn report_counts() {
        let report = AuditReport::new(&[0, 2000, 4000, 5999, 10000], 2000, 0.1);
        assert_eq!(report.segments, 5);
        assert_eq!(report.delta_counts.get(&2000), Some(&2));
        assert_eq!(report.delta_counts.get(&1999), Some(&1));
        assert_eq!(report.smallest, Some(Gap { start: 4000, end: 5999 }));
        assert_eq!(report.largest, Some(Gap { start: 5999, end: 10000 }));
        assert_eq!(report.gap, report.largest);
    }

    #[tokio::test]
    async fn audit_reads_store() {
        let storage = MemoryStorage::new();
        let fetcher = Arc::new(FakeFetcher::default());
        let store = video_store(&storage, &fetcher);
        for id in [96000, 92000, 98000] {
            store.put(id, b"x").await.unwrap();
        }
        storage.insert(store.init_path(), b"init".to_vec());
        storage.insert(store.dir().join("17981336783244063_0-90000.m4v.1-1.part"), b"x".to_vec());

        assert_eq!(stored_ids(&store).await.unwrap(), vec![92000, 96000, 98000]);
        let report = audit_store(&store, 2000, 0.1).await.unwrap();
        assert_eq!(report.gap, Some(Gap { start: 92000, end: 96000 }));
    }
}
