//! Procesamiento de un chunk: lectura del rango, líneas, transformación y
//! escritura de la parte.
//!
//! Una línea pertenece al chunk donde está su primer byte:
//! - los chunks con índice > 0 leen desde un byte antes de su inicio y
//!   descartan la primera línea (es la cola de la última línea del chunk
//!   anterior, o el resto vacío de su '\n');
//! - si el rango no termina en '\n' y el objeto sigue, se lee más allá del
//!   final hasta completar la línea.

use anyhow::Result;
use object_store::ObjectStore;
use tracing::debug;

use crate::chunk::{part_key, ByteRange, ChunkWorkItem};
use crate::storage::{put_bytes, read_range, Storage};
use crate::transform::LineTransform;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Se escribió la parte con `lines` líneas transformadas
    Written { key: String, lines: usize },
    /// Chunk sin líneas propias no vacías: no hay parte, pero cuenta como hecho
    Empty,
}

/// Bytes que el chunk necesita para emitir exactamente sus líneas.
pub async fn fetch_chunk_bytes(
    store: &dyn ObjectStore,
    item: &ChunkWorkItem,
    lookahead: u64,
) -> Result<Vec<u8>> {
    let range = item.byte_range;
    let read_start = if item.chunk_index > 0 {
        range.start.saturating_sub(1)
    } else {
        range.start
    };

    let mut buf = read_range(store, &item.key, ByteRange::new(read_start, range.end))
        .await?
        .to_vec();

    // Sin '\n' todo el rango es cola de una línea del chunk anterior
    if item.chunk_index > 0 && !buf.contains(&b'\n') {
        return Ok(buf);
    }

    let step = lookahead.max(1);
    let mut pos = range.end;
    while pos < item.source_size && buf.last() != Some(&b'\n') {
        let window = ByteRange::new(pos, (pos + step).min(item.source_size));
        let more = read_range(store, &item.key, window).await?;
        if more.is_empty() {
            break;
        }
        match more.iter().position(|b| *b == b'\n') {
            Some(nl) => {
                buf.extend_from_slice(&more[..=nl]);
                break;
            }
            None => {
                buf.extend_from_slice(&more);
                pos = window.end;
            }
        }
    }

    Ok(buf)
}

/// Decodifica (bytes inválidos -> U+FFFD), separa líneas, descarta la primera
/// si `chunk_index > 0` y transforma las no vacías.
pub fn chunk_lines(bytes: &[u8], chunk_index: u32, transform: &LineTransform) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines();
    if chunk_index > 0 {
        lines.next();
    }
    lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| transform.apply(line))
        .collect()
}

/// Procesa un work item completo. Reescribir la misma parte es idempotente.
pub async fn process_chunk(
    storage: &Storage,
    item: &ChunkWorkItem,
    transform: &LineTransform,
    lookahead: u64,
) -> Result<ChunkOutcome> {
    let source = storage.bucket(&item.bucket)?;
    let bytes = fetch_chunk_bytes(source, item, lookahead).await?;
    let lines = chunk_lines(&bytes, item.chunk_index, transform);

    if lines.is_empty() {
        debug!(
            "chunk {} de la tarea {} sin líneas, no se escribe parte",
            item.chunk_index, item.task_id
        );
        return Ok(ChunkOutcome::Empty);
    }

    let key = part_key(&item.task_id, item.chunk_index);
    let count = lines.len();
    put_bytes(storage.parts(), &key, lines.join("\n")).await?;

    Ok(ChunkOutcome::Written { key, lines: count })
}
