use anyhow::{bail, Result};
use object_store::ObjectStore;
use tracing::{debug, warn};

use crate::chunk::{ByteRange, MAX_CHUNKS};
use crate::storage::read_range;

pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 1024 * 1024; // 1 MB
pub const DEFAULT_LOOKAHEAD_BYTES: u64 = 4 * 1024; // 4 KB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    /// Tamaño objetivo de cada chunk
    pub chunk_size: u64,
    /// Bytes que se leen más allá del límite teórico buscando un '\n'
    pub lookahead: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE_BYTES,
            lookahead: DEFAULT_LOOKAHEAD_BYTES,
        }
    }
}

/// Dado un buffer leído a partir de `window_start`, devuelve la posición
/// absoluta justo después del primer '\n'.
pub fn snap_to_line_end(window_start: u64, window: &[u8]) -> Option<u64> {
    window
        .iter()
        .position(|b| *b == b'\n')
        .map(|pos| window_start + pos as u64 + 1)
}

/// Parte un objeto de `size` bytes en rangos contiguos alineados a líneas.
///
/// Cada límite teórico (`start + chunk_size`) se corre hasta justo después
/// del siguiente '\n' si aparece dentro de la ventana de lookahead. Si no
/// aparece, o la lectura falla, se usa el límite teórico y la línea queda
/// partida entre dos chunks.
pub async fn plan_chunks(
    store: &dyn ObjectStore,
    key: &str,
    size: u64,
    config: &ChunkingConfig,
) -> Result<Vec<ByteRange>> {
    if config.chunk_size == 0 {
        bail!("chunk_size tiene que ser > 0");
    }

    let mut ranges: Vec<ByteRange> = Vec::new();
    let mut start: u64 = 0;

    while start < size {
        let potential_end = (start + config.chunk_size).min(size);
        let mut end = potential_end;

        // El último chunk llega hasta EOF, no hace falta mirar
        if potential_end < size {
            // Arrancamos un byte antes: si el límite ya cae después de un '\n'
            // no hay que mover nada.
            let window = ByteRange::new(
                potential_end - 1,
                (potential_end + config.lookahead).min(size),
            );
            match read_range(store, key, window).await {
                Ok(buf) => {
                    if let Some(snapped) = snap_to_line_end(window.start, &buf) {
                        end = snapped;
                    } else {
                        debug!(
                            "sin '\\n' en {} de {}, usando límite teórico {}",
                            window.to_header(),
                            key,
                            potential_end
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "no se pudo leer lookahead del chunk {} de {}: {:?}. Usando límite teórico",
                        ranges.len(),
                        key,
                        e
                    );
                }
            }
        }

        ranges.push(ByteRange::new(start, end));
        if ranges.len() as u64 > MAX_CHUNKS {
            bail!(
                "{} necesita más de {} chunks con chunk_size={}",
                key,
                MAX_CHUNKS,
                config.chunk_size
            );
        }
        start = end;
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{put_bytes, Storage};

    async fn plan_text(text: &str, chunk_size: u64, lookahead: u64) -> Vec<ByteRange> {
        let storage = Storage::in_memory();
        put_bytes(storage.uploads(), "t/in.txt", text.as_bytes().to_vec())
            .await
            .unwrap();
        plan_chunks(
            storage.uploads(),
            "t/in.txt",
            text.len() as u64,
            &ChunkingConfig { chunk_size, lookahead },
        )
        .await
        .unwrap()
    }

    fn assert_partition(ranges: &[ByteRange], size: u64) {
        let mut expected_start = 0;
        for r in ranges {
            assert_eq!(r.start, expected_start, "rangos no contiguos: {ranges:?}");
            assert!(r.end > r.start, "rango vacío: {ranges:?}");
            expected_start = r.end;
        }
        assert_eq!(expected_start, size, "no cubre todo el archivo: {ranges:?}");
    }

    #[test]
    fn snap_finds_first_newline() {
        assert_eq!(snap_to_line_end(10, b"ab\ncd\n"), Some(13));
        assert_eq!(snap_to_line_end(10, b"\n"), Some(11));
        assert_eq!(snap_to_line_end(10, b"abc"), None);
    }

    #[tokio::test]
    async fn boundaries_partition_the_file_for_many_sizes() {
        let text: String = (0..200)
            .map(|i| format!("linea {} {}\n", i, "x".repeat(i % 17)))
            .collect();
        for chunk_size in [1, 2, 3, 7, 16, 64, 100, 1000, 100_000] {
            for lookahead in [0, 1, 4, 32] {
                let ranges = plan_text(&text, chunk_size, lookahead).await;
                assert_partition(&ranges, text.len() as u64);
            }
        }
    }

    #[tokio::test]
    async fn boundaries_snap_after_newline_within_lookahead() {
        let text = "aaaa\nbbbb\ncccc\n";
        let ranges = plan_text(text, 3, 8).await;
        assert_partition(&ranges, text.len() as u64);
        for r in &ranges {
            // cada chunk termina justo después de un '\n'
            assert_eq!(text.as_bytes()[(r.end - 1) as usize], b'\n', "{ranges:?}");
        }
        assert_eq!(
            ranges,
            vec![ByteRange::new(0, 5), ByteRange::new(5, 10), ByteRange::new(10, 15)]
        );
    }

    #[tokio::test]
    async fn boundary_already_on_line_start_is_kept() {
        let text = "ab\ncd\nef";
        let ranges = plan_text(text, 3, 4).await;
        assert_eq!(ranges[0], ByteRange::new(0, 3));
        assert_partition(&ranges, text.len() as u64);
    }

    #[tokio::test]
    async fn no_newline_in_window_falls_back_to_theoretical_boundary() {
        let text = "abcdefghij\nk";
        let ranges = plan_text(text, 4, 2).await;
        assert_eq!(ranges[0], ByteRange::new(0, 4));
        assert_partition(&ranges, text.len() as u64);
    }

    #[tokio::test]
    async fn lookahead_near_eof_is_clamped() {
        let text = "abcdef";
        let ranges = plan_text(text, 4, 4096).await;
        assert_eq!(ranges, vec![ByteRange::new(0, 4), ByteRange::new(4, 6)]);
    }

    #[tokio::test]
    async fn small_file_is_one_chunk() {
        let text = "a\nb\nc";
        let ranges = plan_text(text, DEFAULT_CHUNK_SIZE_BYTES, DEFAULT_LOOKAHEAD_BYTES).await;
        assert_eq!(ranges, vec![ByteRange::new(0, 5)]);
    }

    #[tokio::test]
    async fn zero_size_produces_no_chunks() {
        let ranges = plan_text("", 4, 4).await;
        assert!(ranges.is_empty());
    }

    #[tokio::test]
    async fn zero_chunk_size_is_rejected() {
        let storage = Storage::in_memory();
        let res = plan_chunks(
            storage.uploads(),
            "t/in.txt",
            10,
            &ChunkingConfig { chunk_size: 0, lookahead: 4 },
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn unreadable_lookahead_uses_theoretical_boundaries() {
        // el objeto no existe: todas las lecturas de lookahead fallan
        let storage = Storage::in_memory();
        let ranges = plan_chunks(
            storage.uploads(),
            "t/no-existe.txt",
            10,
            &ChunkingConfig { chunk_size: 4, lookahead: 4 },
        )
        .await
        .unwrap();
        assert_eq!(
            ranges,
            vec![ByteRange::new(0, 4), ByteRange::new(4, 8), ByteRange::new(8, 10)]
        );
    }
}
