use tracing::debug;

use crate::buffer::CfBuffer;
use crate::cache::CfHandles;
use crate::cell::CfPixel;
use crate::error::CfResult;
use crate::pipeline::DeviceTransfer;

/// Placement of one plane inside [`HostCfArray::pixels`].
#[derive(Clone, Debug, PartialEq)]
pub struct PlaneDesc {
    pub freq_hz: f64,
    pub w_value: f64,
    pub mueller: i32,
    pub conj_poln: i32,
    pub x_support: i32,
    pub y_support: i32,
    pub sampling: f32,
    pub nx: usize,
    pub ny: usize,
    pub offset: usize,
}

/// Flattened, contiguous copy of a CF set, the layout an accelerator kernel indexes.
#[derive(Clone, Debug, Default)]
pub struct HostCfArray {
    pub spw_id: usize,
    pub bucket: usize,
    pub pa_deg: f64,
    pub signal: Vec<PlaneDesc>,
    pub weight: Vec<PlaneDesc>,
    pub pixels: Vec<CfPixel>,
}

impl HostCfArray {
    pub fn plane(&self, desc: &PlaneDesc) -> &[CfPixel] {
        &self.pixels[desc.offset..desc.offset + desc.nx * desc.ny]
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len() * std::mem::size_of::<CfPixel>()
    }
}

/// Flattens every set cell, reading lazily deferred pixels from disk.
fn flatten(buffer: &CfBuffer, pixels: &mut Vec<CfPixel>) -> CfResult<Vec<PlaneDesc>> {
    let mut local = buffer.clone();
    let mut descs = Vec::new();
    let set: Vec<(f64, f64, i32)> = buffer
        .cells()
        .iter()
        .filter(|c| c.is_set())
        .map(|c| (c.freq_hz, c.w_value, c.mueller))
        .collect();
    for (freq_hz, w_value, mueller) in set {
        let plane = local.pixels(freq_hz, w_value, mueller)?;
        let Some(params) = local
            .get_cf_cell(freq_hz, w_value, mueller)
            .and_then(|c| c.params.clone())
        else {
            continue;
        };
        descs.push(PlaneDesc {
            freq_hz,
            w_value,
            mueller,
            conj_poln: params.conj_poln,
            x_support: params.x_support,
            y_support: params.y_support,
            sampling: params.sampling,
            nx: params.shape[0],
            ny: params.shape[1],
            offset: pixels.len(),
        });
        pixels.extend_from_slice(&plane);
    }
    Ok(descs)
}

/// Host-memory stand-in for the device upload.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostTransfer;

impl DeviceTransfer for HostTransfer {
    type Handle = HostCfArray;

    fn to_device(&self, spw_id: usize, handles: &CfHandles) -> CfResult<HostCfArray> {
        let mut array = HostCfArray {
            spw_id,
            bucket: handles.bucket,
            pa_deg: handles.pa_deg,
            ..HostCfArray::default()
        };
        if let Some(buffer) = &handles.signal {
            array.signal = flatten(buffer, &mut array.pixels)?;
        }
        if let Some(buffer) = &handles.weight {
            array.weight = flatten(buffer, &mut array.pixels)?;
        }
        debug!(
            "spw {}: {} signal + {} weight planes, {} bytes",
            spw_id,
            array.signal.len(),
            array.weight.len(),
            array.byte_len()
        );
        Ok(array)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CfCache, FreshCf, FreshPlane, LocateStatus, Tiers};

    fn plane(w_index: u32, value: f32) -> FreshPlane {
        FreshPlane {
            w_index,
            w_value: w_index as f64,
            w_incr: 1.0,
            freq_hz: 1.0e9,
            mueller: 0,
            conj_freq_hz: 1.0e9,
            conj_poln: 0,
            x_support: 2,
            y_support: 2,
            sampling: 1.0,
            shape: [2, 2],
            pixels: vec![CfPixel::new(value, 0.0); 4],
        }
    }

    #[test]
    fn planes_are_laid_out_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
        let fresh = FreshCf {
            signal: vec![plane(0, 1.0), plane(1, 2.0)],
            weight: vec![plane(0, 3.0)],
        };
        let handles = cache.cache_conv_function(5.0, &fresh, 0).unwrap();
        let array = HostTransfer.to_device(4, &handles).unwrap();
        assert_eq!(array.spw_id, 4);
        assert_eq!(array.signal.len(), 2);
        assert_eq!(array.weight.len(), 1);
        assert_eq!(array.pixels.len(), 12);
        assert_eq!(array.plane(&array.signal[1])[0], CfPixel::new(2.0, 0.0));
        assert_eq!(array.plane(&array.weight[0])[3], CfPixel::new(3.0, 0.0));
    }

    #[test]
    fn lazy_planes_are_read_once_and_kept_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = CfCache::open(CacheConfig::new(dir.path())).unwrap();
            let fresh = FreshCf {
                signal: vec![plane(0, 7.0)],
                weight: Vec::new(),
            };
            cache.cache_conv_function(5.0, &fresh, 0).unwrap();
            cache.flush().unwrap();
        }
        let mut config = CacheConfig::new(dir.path());
        config.lazy_fill = true;
        config.tiers = Tiers::Signal;
        let mut cache = CfCache::open(config).unwrap();
        let located = cache.locate_conv_function(5.0, 1.0, 1, 0, Tiers::Signal).unwrap();
        assert_eq!(located.status, LocateStatus::DiskHit);
        assert_eq!(cache.mem_usage(), 0);
        let mut handles = located.handles.unwrap();
        assert_eq!(cache.load_pixels(&mut handles).unwrap(), 1);
        let array = HostTransfer.to_device(0, &handles).unwrap();
        assert_eq!(array.plane(&array.signal[0])[0], CfPixel::new(7.0, 0.0));
        assert!(cache.mem_usage() > 0);

        std::fs::remove_file(dir.path().join("CFS_0_0_0_0")).unwrap();
        let again = cache.locate_conv_function(5.0, 1.0, 1, 0, Tiers::Signal).unwrap();
        assert_eq!(again.status, LocateStatus::MemoryHit);
        let mut handles = again.handles.unwrap();
        assert_eq!(cache.load_pixels(&mut handles).unwrap(), 0);
        let array = HostTransfer.to_device(1, &handles).unwrap();
        assert_eq!(array.plane(&array.signal[0])[3], CfPixel::new(7.0, 0.0));
    }
}
