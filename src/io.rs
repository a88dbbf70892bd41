//! Safetensors I/O and the on-disk artifact layout.
//!
//! Recordings (input and cleaned) share one versioned schema:
//!
//! | tensor            | dtype | shape  | notes                          |
//! |-------------------|-------|--------|--------------------------------|
//! | `data`            | F32   | [C, T] |                                |
//! | `sfreq`           | F32   | [1]    |                                |
//! | `chan_pos`        | F32   | [C, 3] | NaN row = unknown position     |
//! | `ch_names`        | U8    | [n]    | newline-joined UTF-8           |
//! | `event_onsets`    | I64   | [E]    | samples                        |
//! | `event_durations` | I64   | [E]    | −1 = none                      |
//! | `event_labels`    | U8    | [n]    | newline-joined UTF-8           |
//! | `ch_status`       | U8    | [C]    | cleaned output only            |
//!
//! The header carries `__metadata__.schema = "eegclean.recording/1"`; a
//! file without it is read as version 1.  Every write goes to a sibling
//! temp file first and is renamed into place.
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::decompose::{ConvergenceTrace, Decomposition};
use crate::error::{CleanError, Result};
use crate::recording::{Channel, ChannelStatus, Event, Recording};

pub const RECORDING_SCHEMA: &str = "eegclean.recording/1";
pub const WEIGHTS_SCHEMA: &str = "eegclean.weights/1";

// ── Reader ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct TensorInfo {
    dtype: String,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A parsed safetensors file held in memory.
pub struct StFile {
    bytes: Vec<u8>,
    data_start: usize,
    tensors: HashMap<String, TensorInfo>,
    metadata: HashMap<String, String>,
}

fn malformed(msg: impl Into<String>) -> CleanError {
    CleanError::Input(format!("malformed safetensors file: {}", msg.into()))
}

impl StFile {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::parse(bytes)
    }

    pub fn parse(bytes: Vec<u8>) -> Result<Self> {
        let len_bytes: [u8; 8] = bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| malformed("file too small"))?;
        let n = u64::from_le_bytes(len_bytes) as usize;
        let header_end = 8usize
            .checked_add(n)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| malformed("header length out of range"))?;
        let header: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&bytes[8..header_end])
                .map_err(|e| malformed(format!("header is not valid JSON: {e}")))?;

        let payload = bytes.len() - header_end;
        let mut tensors = HashMap::new();
        let mut metadata = HashMap::new();
        for (name, entry) in header {
            if name == "__metadata__" {
                if let Some(obj) = entry.as_object() {
                    for (k, v) in obj {
                        if let Some(s) = v.as_str() {
                            metadata.insert(k.clone(), s.to_string());
                        }
                    }
                }
                continue;
            }
            let dtype = entry["dtype"]
                .as_str()
                .ok_or_else(|| malformed(format!("'{name}' has no dtype")))?;
            let shape = entry["shape"]
                .as_array()
                .ok_or_else(|| malformed(format!("'{name}' has no shape")))?
                .iter()
                .map(|v| v.as_u64().map(|d| d as usize))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| malformed(format!("'{name}' has a non-integer shape")))?;
            let offsets = entry["data_offsets"]
                .as_array()
                .and_then(|o| Some((o.first()?.as_u64()? as usize, o.get(1)?.as_u64()? as usize)))
                .ok_or_else(|| malformed(format!("'{name}' has no data_offsets")))?;
            if offsets.0 > offsets.1 || offsets.1 > payload {
                return Err(malformed(format!("'{name}' data_offsets out of range")));
            }
            tensors.insert(
                name,
                TensorInfo { dtype: dtype.to_string(), shape, start: offsets.0, end: offsets.1 },
            );
        }
        Ok(Self { bytes, data_start: header_end, tensors, metadata })
    }

    pub fn has(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn shape(&self, name: &str) -> Result<&[usize]> {
        self.info(name).map(|t| t.shape.as_slice())
    }

    fn info(&self, name: &str) -> Result<&TensorInfo> {
        self.tensors
            .get(name)
            .ok_or_else(|| CleanError::Input(format!("missing tensor '{name}'")))
    }

    fn raw(&self, name: &str, dtype: &str, width: usize) -> Result<&[u8]> {
        let t = self.info(name)?;
        if t.dtype != dtype {
            return Err(CleanError::Input(format!(
                "tensor '{name}' is {}, expected {dtype}",
                t.dtype
            )));
        }
        let raw = &self.bytes[self.data_start + t.start..self.data_start + t.end];
        let expected = t
            .shape
            .iter()
            .try_fold(width, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| malformed(format!("'{name}' shape {:?} overflows", t.shape)))?;
        if raw.len() != expected {
            return Err(malformed(format!(
                "'{name}' holds {} bytes, shape needs {expected}",
                raw.len()
            )));
        }
        Ok(raw)
    }

    pub fn f32(&self, name: &str) -> Result<Vec<f32>> {
        Ok(self
            .raw(name, "F32", 4)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn f64(&self, name: &str) -> Result<Vec<f64>> {
        Ok(self
            .raw(name, "F64", 8)?
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect())
    }

    pub fn i64(&self, name: &str) -> Result<Vec<i64>> {
        Ok(self
            .raw(name, "I64", 8)?
            .chunks_exact(8)
            .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect())
    }

    pub fn u8(&self, name: &str) -> Result<&[u8]> {
        self.raw(name, "U8", 1)
    }

    /// Newline-joined UTF-8 strings stored as a U8 tensor.
    pub fn strings(&self, name: &str) -> Result<Vec<String>> {
        let raw = self.u8(name)?;
        if raw.is_empty() {
            return Ok(vec![]);
        }
        let s = std::str::from_utf8(raw)
            .map_err(|e| CleanError::Input(format!("tensor '{name}' is not UTF-8: {e}")))?;
        Ok(s.split('\n').map(String::from).collect())
    }

    pub fn f32_arr2(&self, name: &str) -> Result<Array2<f32>> {
        let shape = self.shape(name)?.to_vec();
        let [r, c] = shape[..] else {
            return Err(CleanError::Input(format!("tensor '{name}' must be 2-D, got {shape:?}")));
        };
        Ok(Array2::from_shape_vec((r, c), self.f32(name)?)?)
    }

    pub fn f64_arr2(&self, name: &str) -> Result<Array2<f64>> {
        let shape = self.shape(name)?.to_vec();
        let [r, c] = shape[..] else {
            return Err(CleanError::Input(format!("tensor '{name}' must be 2-D, got {shape:?}")));
        };
        Ok(Array2::from_shape_vec((r, c), self.f64(name)?)?)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Safetensors file builder (F32, F64, I64 and U8 tensors).
///
/// ```rust,no_run
/// use eegclean::io::StWriter;
/// use std::path::Path;
/// let mut w = StWriter::new().with_schema("example/1");
/// w.add_f32("signal", &[1.0f32, 2.0, 3.0], &[1, 3]);
/// w.add_strings("names", &["a".to_string(), "b".to_string()]);
/// w.write(Path::new("/tmp/out.safetensors")).unwrap();
/// ```
#[derive(Default)]
pub struct StWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl StWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.metadata.insert("schema".into(), schema.into());
        self
    }

    pub fn add_f32(&mut self, name: &str, data: &[f32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F32", shape.to_vec()));
    }

    pub fn add_f32_arr2(&mut self, name: &str, arr: &Array2<f32>) {
        let data: Vec<f32> = arr.iter().copied().collect();
        self.add_f32(name, &data, &[arr.nrows(), arr.ncols()]);
    }

    pub fn add_f64(&mut self, name: &str, data: &[f64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F64", shape.to_vec()));
    }

    pub fn add_f64_arr2(&mut self, name: &str, arr: &Array2<f64>) {
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, &[arr.nrows(), arr.ncols()]);
    }

    pub fn add_i64(&mut self, name: &str, data: &[i64]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I64", vec![data.len()]));
    }

    pub fn add_u8(&mut self, name: &str, data: &[u8]) {
        self.entries.push((name.to_string(), data.to_vec(), "U8", vec![data.len()]));
    }

    pub fn add_strings(&mut self, name: &str, items: &[String]) {
        self.add_u8(name, items.join("\n").as_bytes());
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut header_map = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header_map
                .insert("__metadata__".into(), serde_json::Value::Object(self.metadata.clone()));
        }
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(
                name.clone(),
                serde_json::json!({
                    "dtype": dtype,
                    "shape": shape,
                    "data_offsets": [offset, offset + data.len()],
                }),
            );
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;
        let mut out = Vec::with_capacity(8 + hdr_bytes.len() + pad + offset);
        out.extend_from_slice(&((hdr_bytes.len() + pad) as u64).to_le_bytes());
        out.extend_from_slice(&hdr_bytes);
        out.extend(std::iter::repeat(b' ').take(pad));
        for (_, data, _, _) in &self.entries {
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &self.to_bytes()?)
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path.file_name().ok_or_else(|| {
        CleanError::Invariant(format!("output path {} has no file name", path.display()))
    })?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ── Recording schema ──────────────────────────────────────────────────────────

/// Load a recording; statuses default to template-assigned when absent.
pub fn read_recording(path: &Path) -> Result<Recording> {
    let st = StFile::open(path)?;
    if let Some(schema) = st.metadata("schema") {
        if schema != RECORDING_SCHEMA {
            return Err(CleanError::Input(format!(
                "{}: unsupported schema '{schema}' (expected {RECORDING_SCHEMA})",
                path.display()
            )));
        }
    }

    let data = st.f32_arr2("data")?;
    let n_ch = data.nrows();
    let sfreq = *st
        .f32("sfreq")?
        .first()
        .ok_or_else(|| CleanError::Input("tensor 'sfreq' is empty".into()))?;

    let labels = st.strings("ch_names")?;
    if labels.len() != n_ch {
        return Err(CleanError::Input(format!(
            "{} channel names for {n_ch} data rows",
            labels.len()
        )));
    }

    let positions: Vec<Option<[f64; 3]>> = if st.has("chan_pos") {
        let pos = st.f32_arr2("chan_pos")?;
        if pos.dim() != (n_ch, 3) {
            return Err(CleanError::Input(format!(
                "chan_pos is {:?}, expected [{n_ch}, 3]",
                pos.dim()
            )));
        }
        pos.rows()
            .into_iter()
            .map(|r| {
                let p = [r[0] as f64, r[1] as f64, r[2] as f64];
                p.iter().all(|v| v.is_finite()).then_some(p)
            })
            .collect()
    } else {
        vec![None; n_ch]
    };

    let statuses: Vec<ChannelStatus> = if st.has("ch_status") {
        let codes = st.u8("ch_status")?;
        if codes.len() != n_ch {
            return Err(CleanError::Input(format!(
                "{} channel statuses for {n_ch} channels",
                codes.len()
            )));
        }
        codes
            .iter()
            .map(|&c| {
                ChannelStatus::from_code(c)
                    .ok_or_else(|| CleanError::Input(format!("unknown channel status {c}")))
            })
            .collect::<Result<_>>()?
    } else {
        vec![ChannelStatus::TemplateAssigned; n_ch]
    };

    let channels = labels
        .into_iter()
        .zip(positions)
        .zip(statuses)
        .map(|((label, position), status)| Channel { label, position, status })
        .collect();

    let events = if st.has("event_onsets") {
        read_events(&st)?
    } else {
        vec![]
    };
    Recording::new(data, sfreq, channels, events)
}

fn read_events(st: &StFile) -> Result<Vec<Event>> {
    let onsets = st.i64("event_onsets")?;
    let labels = st.strings("event_labels")?;
    let durations = if st.has("event_durations") {
        st.i64("event_durations")?
    } else {
        vec![-1; onsets.len()]
    };
    if labels.len() != onsets.len() || durations.len() != onsets.len() {
        return Err(CleanError::Input(format!(
            "event tensors disagree: {} onsets, {} labels, {} durations",
            onsets.len(),
            labels.len(),
            durations.len()
        )));
    }
    onsets
        .into_iter()
        .zip(durations)
        .zip(labels)
        .map(|((onset, duration), label)| {
            let onset = usize::try_from(onset).map_err(|_| {
                CleanError::Input(format!("event '{label}' has negative onset {onset}"))
            })?;
            let duration = usize::try_from(duration).ok();
            Ok(Event { label, onset, duration })
        })
        .collect()
}

/// Write a recording, including channel statuses.
pub fn write_recording(path: &Path, rec: &Recording) -> Result<()> {
    let mut w = StWriter::new().with_schema(RECORDING_SCHEMA);
    w.add_f32_arr2("data", &rec.data);
    w.add_f32("sfreq", &[rec.sfreq], &[1]);
    let pos: Vec<f32> = rec
        .channels
        .iter()
        .flat_map(|c| c.position.map_or([f32::NAN; 3], |p| [p[0] as f32, p[1] as f32, p[2] as f32]))
        .collect();
    w.add_f32("chan_pos", &pos, &[rec.n_channels(), 3]);
    w.add_strings("ch_names", &rec.labels());
    let status: Vec<u8> = rec.channels.iter().map(|c| c.status.code()).collect();
    w.add_u8("ch_status", &status);
    let onsets: Vec<i64> = rec.events.iter().map(|e| e.onset as i64).collect();
    let durations: Vec<i64> =
        rec.events.iter().map(|e| e.duration.map_or(-1, |d| d as i64)).collect();
    let labels: Vec<String> = rec.events.iter().map(|e| e.label.clone()).collect();
    w.add_i64("event_onsets", &onsets);
    w.add_i64("event_durations", &durations);
    w.add_strings("event_labels", &labels);
    w.write(path)
}

// ── Weights ───────────────────────────────────────────────────────────────────

/// Decomposition weights plus classifier output, as stored on disk.
#[derive(Debug, Clone)]
pub struct StoredWeights {
    pub unmixing: Array2<f64>,
    pub sphere: Array2<f64>,
    pub mixing: Array2<f64>,
    pub trace: ConvergenceTrace,
    pub probabilities: Array2<f64>,
    pub removed: Vec<usize>,
}

pub fn write_weights(
    path: &Path,
    decomposition: &Decomposition,
    probabilities: &Array2<f64>,
    removed: &[usize],
) -> Result<()> {
    let mut w = StWriter::new().with_schema(WEIGHTS_SCHEMA);
    w.add_f64_arr2("unmixing", &decomposition.unmixing);
    w.add_f64_arr2("sphere", &decomposition.sphere);
    w.add_f64_arr2("mixing", &decomposition.mixing);
    let trace: Vec<f64> = decomposition
        .trace
        .points
        .iter()
        .flat_map(|&(i, ll)| [i as f64, ll])
        .collect();
    w.add_f64("ll_trace", &trace, &[decomposition.trace.len(), 2]);
    w.add_f64_arr2("ic_probabilities", probabilities);
    let removed: Vec<i64> = removed.iter().map(|&i| i as i64).collect();
    w.add_i64("removed", &removed);
    w.write(path)
}

pub fn read_weights(path: &Path) -> Result<StoredWeights> {
    let st = StFile::open(path)?;
    let trace_flat = st.f64("ll_trace")?;
    let mut trace = ConvergenceTrace::default();
    for pair in trace_flat.chunks_exact(2) {
        trace.push(pair[0] as usize, pair[1]);
    }
    let removed = st
        .i64("removed")?
        .into_iter()
        .map(|i| {
            usize::try_from(i)
                .map_err(|_| CleanError::Input(format!("negative component index {i}")))
        })
        .collect::<Result<_>>()?;
    Ok(StoredWeights {
        unmixing: st.f64_arr2("unmixing")?,
        sphere: st.f64_arr2("sphere")?,
        mixing: st.f64_arr2("mixing")?,
        trace,
        probabilities: st.f64_arr2("ic_probabilities")?,
        removed,
    })
}

// ── Paths ─────────────────────────────────────────────────────────────────────

/// `<input_dir>/<subject>.safetensors`
pub fn input_path(input_dir: &Path, subject: &str) -> PathBuf {
    input_dir.join(format!("{subject}.safetensors"))
}

/// Per-subject output subtree `<root>/<subject>/`.
#[derive(Debug, Clone)]
pub struct SubjectPaths {
    pub dir: PathBuf,
    pub cleaned: PathBuf,
    pub weights: PathBuf,
    pub qc_json: PathBuf,
    pub qc_text: PathBuf,
    pub error_log: PathBuf,
}

impl SubjectPaths {
    pub fn new(output_root: &Path, subject: &str) -> Self {
        let dir = output_root.join(subject);
        Self {
            cleaned: dir.join(format!("{subject}_cleaned.safetensors")),
            weights: dir.join(format!("{subject}_weights.safetensors")),
            qc_json: dir.join(format!("{subject}_qc.json")),
            qc_text: dir.join(format!("{subject}_qc.txt")),
            error_log: dir.join(format!("{subject}_error.log")),
            dir,
        }
    }

    /// The QC JSON is written last; its presence marks a finished subject.
    pub fn is_complete(&self) -> bool {
        self.qc_json.is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> Recording {
        let chans = vec![
            Channel::new("Fp1", Some([0.0, 1.0, 0.0])),
            Channel::new("Cz", None),
            Channel::new("Oz", Some([0.0, -1.0, 0.0])),
        ];
        let mut ev = Event::new("stim", 3);
        ev.duration = Some(2);
        let events = vec![ev, Event::new("resp", 7)];
        let data = Array2::from_shape_fn((3, 10), |(c, t)| (c * 10 + t) as f32);
        let mut rec = Recording::new(data, 250.0, chans, events).unwrap();
        rec.channels[1].status = ChannelStatus::Interpolated;
        rec
    }

    #[test]
    fn recording_survives_a_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.safetensors");
        let rec = sample();
        write_recording(&path, &rec).unwrap();
        let back = read_recording(&path).unwrap();
        assert_eq!(back.data, rec.data);
        assert_eq!(back.sfreq, 250.0);
        assert_eq!(back.channels, rec.channels);
        assert_eq!(back.events, rec.events);
        assert!(!dir.path().join("r.safetensors.tmp").exists());
    }

    #[test]
    fn header_carries_schema() {
        let bytes = StWriter::new().with_schema(RECORDING_SCHEMA).to_bytes().unwrap();
        let st = StFile::parse(bytes).unwrap();
        assert_eq!(st.metadata("schema"), Some(RECORDING_SCHEMA));
    }

    #[test]
    fn unknown_schema_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.safetensors");
        let mut w = StWriter::new().with_schema("eegclean.recording/9");
        w.add_f32_arr2("data", &array![[1.0f32, 2.0]]);
        w.write(&path).unwrap();
        assert!(matches!(read_recording(&path), Err(CleanError::Input(_))));
    }

    #[test]
    fn schema_less_file_reads_as_v1() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.safetensors");
        let mut w = StWriter::new();
        w.add_f32_arr2("data", &array![[1.0f32, 2.0], [3.0, 4.0]]);
        w.add_f32("sfreq", &[100.0], &[1]);
        w.add_strings("ch_names", &["C3".into(), "C4".into()]);
        w.write(&path).unwrap();
        let rec = read_recording(&path).unwrap();
        assert_eq!(rec.labels(), vec!["C3", "C4"]);
        assert!(rec.events.is_empty());
        assert!(rec.channels.iter().all(|c| c.position.is_none()));
    }

    #[test]
    fn truncated_and_mismatched_files_are_input_errors() {
        assert!(matches!(StFile::parse(vec![1, 2, 3]), Err(CleanError::Input(_))));
        let mut w = StWriter::new();
        w.add_f32_arr2("data", &array![[1.0f32, 2.0]]);
        w.add_f32("sfreq", &[100.0], &[1]);
        w.add_strings("ch_names", &["A".into(), "B".into()]);
        let st = StFile::parse(w.to_bytes().unwrap()).unwrap();
        assert!(matches!(st.f64("data"), Err(CleanError::Input(_))));
        assert!(matches!(st.f32("nope"), Err(CleanError::Input(_))));
    }

    #[test]
    fn overflowing_shape_is_rejected() {
        let header = r#"{"data":{"dtype":"F32","shape":[4294967296,4294967296,16],
            "data_offsets":[0,4]}}"#;
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&[0; 4]);
        let st = StFile::parse(bytes).unwrap();
        match st.f32("data") {
            Err(CleanError::Input(msg)) => assert!(msg.contains("overflows"), "{msg}"),
            other => panic!("expected an input error, got {other:?}"),
        }
    }

    #[test]
    fn subject_paths() {
        let p = SubjectPaths::new(Path::new("/out"), "P07");
        assert_eq!(p.cleaned, Path::new("/out/P07/P07_cleaned.safetensors"));
        assert_eq!(p.qc_json, Path::new("/out/P07/P07_qc.json"));
        assert_eq!(p.error_log, Path::new("/out/P07/P07_error.log"));
        assert!(!p.is_complete());
    }
}
