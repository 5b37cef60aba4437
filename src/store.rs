use tracing::debug;

use crate::buffer::CfBuffer;

/// Memory tier: PA bucket -> [`CfBuffer`].
///
/// The position of a buffer in the store is its bucket index, which also names
/// its artifacts on disk. Buckets are only ever appended.
#[derive(Clone, Debug, Default)]
pub struct CfStore {
    buffers: Vec<CfBuffer>,
}

impl CfStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[CfBuffer] {
        &self.buffers
    }

    pub fn buffer(&self, bucket: usize) -> Option<&CfBuffer> {
        self.buffers.get(bucket)
    }

    pub fn buffer_mut(&mut self, bucket: usize) -> Option<&mut CfBuffer> {
        self.buffers.get_mut(bucket)
    }

    /// Closest bucket of this baseline type within `dpa_deg`, if any.
    ///
    /// Equidistant buckets resolve to the one created first.
    pub fn find(&self, pa_deg: f64, dpa_deg: f64, baseline_type: i32) -> Option<usize> {
        if !pa_deg.is_finite() {
            return None;
        }
        let mut best: Option<(usize, f64)> = None;
        for (idx, buffer) in self.buffers.iter().enumerate() {
            if buffer.baseline_type() != baseline_type {
                continue;
            }
            let diff = (buffer.pa_deg() - pa_deg).abs();
            if best.map(|(_, d)| diff < d).unwrap_or(true) {
                best = Some((idx, diff));
            }
        }
        best.filter(|&(_, diff)| diff <= dpa_deg).map(|(idx, _)| idx)
    }

    /// Bucket index for `pa_deg`, creating an empty bucket when none is within `dpa_deg`.
    pub fn get_or_create(&mut self, pa_deg: f64, dpa_deg: f64, baseline_type: i32) -> usize {
        if let Some(idx) = self.find(pa_deg, dpa_deg, baseline_type) {
            return idx;
        }
        let idx = self.buffers.len();
        debug!(
            "new PA bucket {} at {:.3} deg (baseline type {})",
            idx, pa_deg, baseline_type
        );
        self.buffers.push(CfBuffer::new(idx, pa_deg, baseline_type));
        idx
    }

    /// The buffer for `pa_deg`; see [`CfStore::get_or_create`].
    pub fn get_cf_buffer(&mut self, pa_deg: f64, dpa_deg: f64, baseline_type: i32) -> &mut CfBuffer {
        let idx = self.get_or_create(pa_deg, dpa_deg, baseline_type);
        &mut self.buffers[idx]
    }

    /// Loaded pixel bytes across all buckets.
    pub fn mem_usage(&self) -> usize {
        self.buffers.iter().map(CfBuffer::mem_usage).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::CfStore;

    #[test]
    fn lookups_within_tolerance_reuse_the_bucket() {
        let mut store = CfStore::new();
        let first = store.get_cf_buffer(30.0, 2.0, 0).bucket();
        for pa in [30.5, 31.0, 31.5, 32.0, 28.0] {
            assert_eq!(store.get_cf_buffer(pa, 2.0, 0).bucket(), first);
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.buffer(first).unwrap().pa_deg(), 30.0);
    }

    #[test]
    fn lookup_outside_tolerance_creates_a_bucket() {
        let mut store = CfStore::new();
        store.get_or_create(30.0, 2.0, 0);
        let second = store.get_or_create(32.5, 2.0, 0);
        assert_eq!(second, 1);
        assert_eq!(store.get_or_create(33.0, 2.0, 0), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn nearest_bucket_wins_and_ties_go_to_the_older_one() {
        let mut store = CfStore::new();
        store.get_or_create(10.0, 1.0, 0);
        store.get_or_create(12.0, 1.0, 0);
        assert_eq!(store.find(11.6, 5.0, 0), Some(1));
        assert_eq!(store.find(11.0, 5.0, 0), Some(0));
        assert_eq!(store.find(f64::NAN, 5.0, 0), None);
    }

    #[test]
    fn baseline_types_keep_separate_buckets() {
        let mut store = CfStore::new();
        let a = store.get_or_create(20.0, 1.0, 0);
        let b = store.get_or_create(20.0, 1.0, 1);
        assert_ne!(a, b);
        assert_eq!(store.find(20.2, 1.0, 1), Some(b));
        assert_eq!(store.find(20.2, 1.0, 2), None);
    }
}
