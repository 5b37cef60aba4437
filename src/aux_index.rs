use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;

use crate::artifact::CfKind;
use crate::error::{CfCacheError, CfResult};
use crate::store::CfStore;

pub const AUX_INDEX_NAME: &str = "aux.dat";
const AUX_HEADER: &str = "# kind pa_deg baseline_type (x_support y_support) per w-plane sampling";

/// One line of the auxiliary index.
#[derive(Clone, Debug, PartialEq)]
pub struct AuxBucket {
    pub kind: CfKind,
    pub pa_deg: f64,
    pub baseline_type: i32,
    /// Per w-plane support; `(0, 0)` for planes never computed.
    pub supports: Vec<(i32, i32)>,
    pub sampling: f32,
}

/// Per-bucket summary persisted next to the artifacts so a later run can seed
/// bucket order before parsing any header.
///
/// Signal and weight buckets are listed separately; each tier keeps its own order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AuxIndex {
    pub buckets: Vec<AuxBucket>,
}

fn parse_field<T: std::str::FromStr>(path: &Path, line_no: usize, raw: Option<&str>, what: &str) -> CfResult<T> {
    let raw = raw.ok_or_else(|| {
        CfCacheError::parse(
            path.display().to_string(),
            format!("line {}: missing {}", line_no, what),
        )
    })?;
    raw.parse::<T>().map_err(|_| {
        CfCacheError::parse(
            path.display().to_string(),
            format!("line {}: bad {} {:?}", line_no, what, raw),
        )
    })
}

impl AuxIndex {
    /// Snapshot of every bucket in `store`.
    pub fn from_store(store: &CfStore, kind: CfKind) -> Self {
        let n_w = store
            .buffers()
            .iter()
            .map(|b| b.w_list().len())
            .max()
            .unwrap_or(0);
        let buckets = store
            .buffers()
            .iter()
            .map(|buffer| AuxBucket {
                kind,
                pa_deg: buffer.pa_deg(),
                baseline_type: buffer.baseline_type(),
                supports: (0..n_w)
                    .map(|wi| buffer.support_for_w(wi).unwrap_or((0, 0)))
                    .collect(),
                sampling: buffer.sampling().unwrap_or(0.0),
            })
            .collect();
        Self { buckets }
    }

    /// Buckets of one tier, in bucket-index order.
    pub fn of_kind(&self, kind: CfKind) -> impl Iterator<Item = &AuxBucket> {
        self.buckets.iter().filter(move |b| b.kind == kind)
    }

    /// Append the buckets of `other`.
    pub fn extend(&mut self, other: AuxIndex) {
        self.buckets.extend(other.buckets);
    }

    pub fn w_planes(&self) -> usize {
        self.buckets.iter().map(|b| b.supports.len()).max().unwrap_or(0)
    }

    /// `Ok(None)` when no index has been written yet.
    pub fn read(path: &Path) -> CfResult<Option<Self>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(CfCacheError::io(path, err)),
        };
        let reader = BufReader::new(file);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| CfCacheError::io(path, e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            lines.push(trimmed.to_string());
        }
        let Some((counts, rows)) = lines.split_first() else {
            return Ok(Some(Self::default()));
        };

        let mut fields = counts.split_whitespace();
        let n_bucket: usize = parse_field(path, 1, fields.next(), "bucket count")?;
        let n_w: usize = parse_field(path, 1, fields.next(), "w-plane count")?;
        if rows.len() != n_bucket {
            return Err(CfCacheError::parse(
                path.display().to_string(),
                format!("declares {} buckets, lists {}", n_bucket, rows.len()),
            ));
        }

        let mut buckets = Vec::with_capacity(n_bucket);
        for (i, row) in rows.iter().enumerate() {
            let line_no = i + 2;
            let mut fields = row.split_whitespace();
            let kind = match fields.next() {
                Some(p) if p == CfKind::Signal.prefix() => CfKind::Signal,
                Some(p) if p == CfKind::Weight.prefix() => CfKind::Weight,
                other => {
                    return Err(CfCacheError::parse(
                        path.display().to_string(),
                        format!("line {}: bad kind {:?}", line_no, other),
                    ))
                }
            };
            let pa_deg: f64 = parse_field(path, line_no, fields.next(), "pa")?;
            let baseline_type: i32 = parse_field(path, line_no, fields.next(), "baseline type")?;
            let mut supports = Vec::with_capacity(n_w);
            for _ in 0..n_w {
                let xs: i32 = parse_field(path, line_no, fields.next(), "x support")?;
                let ys: i32 = parse_field(path, line_no, fields.next(), "y support")?;
                supports.push((xs, ys));
            }
            let sampling: f32 = parse_field(path, line_no, fields.next(), "sampling")?;
            if fields.next().is_some() {
                return Err(CfCacheError::parse(
                    path.display().to_string(),
                    format!("line {}: trailing fields", line_no),
                ));
            }
            buckets.push(AuxBucket {
                kind,
                pa_deg,
                baseline_type,
                supports,
                sampling,
            });
        }
        Ok(Some(Self { buckets }))
    }

    /// Replace the index at `path` via a temporary file and rename.
    pub fn write(&self, path: &Path) -> CfResult<()> {
        let tmp = path.with_extension("dat.tmp");
        let n_w = self.w_planes();
        {
            let file = File::create(&tmp).map_err(|e| CfCacheError::io(&tmp, e))?;
            let mut writer = BufWriter::new(file);
            let io_err = |e| CfCacheError::io(&tmp, e);
            writeln!(writer, "{}", AUX_HEADER).map_err(io_err)?;
            writeln!(writer, "{} {}", self.buckets.len(), n_w).map_err(io_err)?;
            for bucket in &self.buckets {
                write!(
                    writer,
                    "{} {} {}",
                    bucket.kind.prefix(),
                    bucket.pa_deg,
                    bucket.baseline_type
                ).map_err(io_err)?;
                for wi in 0..n_w {
                    let (xs, ys) = bucket.supports.get(wi).copied().unwrap_or((0, 0));
                    write!(writer, " {} {}", xs, ys).map_err(io_err)?;
                }
                writeln!(writer, " {}", bucket.sampling).map_err(io_err)?;
            }
            writer.flush().map_err(io_err)?;
            writer.get_ref().sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(|e| CfCacheError::io(path, e))
    }
}
