use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Ancho del índice en el nombre de las partes: part-000042.txt
pub const PART_INDEX_WIDTH: usize = 6;

/// Máximo de chunks que entra en PART_INDEX_WIDTH dígitos.
pub const MAX_CHUNKS: u64 = 999_999;

/// Rango de bytes semiabierto [start, end).
///
/// En el cable viaja como `bytes=<primero>-<último>` (extremo inclusivo),
/// igual que una cabecera HTTP Range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }

    pub fn parse_header(s: &str) -> Result<Self> {
        let bounds = s
            .trim()
            .strip_prefix("bytes=")
            .with_context(|| format!("rango sin prefijo 'bytes=': {s}"))?;
        let (first, last) = bounds
            .split_once('-')
            .with_context(|| format!("rango sin '-': {s}"))?;
        let first: u64 = first.parse().with_context(|| format!("inicio inválido en {s}"))?;
        let last: u64 = last.parse().with_context(|| format!("fin inválido en {s}"))?;
        if last < first {
            bail!("rango invertido: {s}");
        }
        Ok(Self::new(first, last + 1))
    }
}

impl Serialize for ByteRange {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_header())
    }
}

impl<'de> Deserialize<'de> for ByteRange {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ByteRange::parse_header(&s).map_err(serde::de::Error::custom)
    }
}

/// Unidad de trabajo que viaja por la cola: un chunk de un archivo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkWorkItem {
    pub task_id: TaskId,
    pub bucket: String,
    pub key: String,
    pub byte_range: ByteRange,
    pub chunk_index: u32,
    /// Tamaño total del objeto origen
    pub source_size: u64,
}

/// Evento de "archivo subido" (lo que dispara el planner).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub bucket: String,
    pub key: String,
}

impl UploadEvent {
    /// La convención de keys es `<taskId>/<filename>`.
    pub fn task_id(&self) -> Result<&str> {
        split_upload_key(&self.key).map(|(task_id, _)| task_id)
    }

    pub fn filename(&self) -> Result<&str> {
        split_upload_key(&self.key).map(|(_, name)| name)
    }
}

pub fn split_upload_key(key: &str) -> Result<(&str, &str)> {
    let (task_id, filename) = key
        .split_once('/')
        .with_context(|| format!("key sin formato <taskId>/<filename>: {key}"))?;
    if task_id.is_empty() || filename.is_empty() {
        bail!("key sin formato <taskId>/<filename>: {key}");
    }
    Ok((task_id, filename))
}

pub fn upload_key(task_id: &str, filename: &str) -> String {
    format!("{}/{}", task_id, filename)
}

/// Prefijo de las partes de una tarea (namespace por task).
pub fn parts_prefix(task_id: &str) -> String {
    format!("{}/", task_id)
}

/// Key de la parte `chunk_index`. El cero-padding hace que el orden
/// lexicográfico coincida con el numérico.
pub fn part_key(task_id: &str, chunk_index: u32) -> String {
    format!(
        "{}/part-{:0width$}.txt",
        task_id,
        chunk_index,
        width = PART_INDEX_WIDTH
    )
}

pub fn processed_filename(original_filename: &str) -> String {
    format!("processed-{}", original_filename)
}

pub fn processed_key(task_id: &str, original_filename: &str) -> String {
    format!("{}/{}", task_id, processed_filename(original_filename))
}
