//! Almacenamiento de objetos compartido entre master y workers.
//!
//! Cada "bucket" lógico es un `ObjectStore` independiente. En despliegue son
//! subdirectorios de un volumen compartido (`/data/uploads`, `/data/parts`,
//! `/data/processed`); en tests se usa `InMemory`.

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{ObjectStore, PutPayload};
use std::path::Path;
use std::sync::Arc;

use crate::chunk::ByteRange;

/// Ruta ya codificada de un objeto, tal como la devuelve `list_objects`.
pub use object_store::path::Path as ObjectPath;

pub const UPLOADS_BUCKET: &str = "uploads";
pub const PARTS_BUCKET: &str = "parts";
pub const PROCESSED_BUCKET: &str = "processed";

#[derive(Clone)]
pub struct Storage {
    uploads: Arc<dyn ObjectStore>,
    parts: Arc<dyn ObjectStore>,
    processed: Arc<dyn ObjectStore>,
}

impl Storage {
    /// Un directorio por bucket bajo `root`.
    pub fn local(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let open = |name: &str| -> Result<Arc<dyn ObjectStore>> {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("no se pudo crear {}", dir.display()))?;
            let store = LocalFileSystem::new_with_prefix(&dir)
                .with_context(|| format!("no se pudo abrir {}", dir.display()))?;
            Ok(Arc::new(store))
        };

        tracing::info!("usando almacenamiento local en {}", root.display());
        Ok(Self {
            uploads: open(UPLOADS_BUCKET)?,
            parts: open(PARTS_BUCKET)?,
            processed: open(PROCESSED_BUCKET)?,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            uploads: Arc::new(InMemory::new()),
            parts: Arc::new(InMemory::new()),
            processed: Arc::new(InMemory::new()),
        }
    }

    pub fn uploads(&self) -> &dyn ObjectStore {
        self.uploads.as_ref()
    }

    pub fn parts(&self) -> &dyn ObjectStore {
        self.parts.as_ref()
    }

    pub fn processed(&self) -> &dyn ObjectStore {
        self.processed.as_ref()
    }

    /// Resuelve el bucket nombrado en un evento o work item.
    pub fn bucket(&self, name: &str) -> Result<&dyn ObjectStore> {
        match name {
            UPLOADS_BUCKET => Ok(self.uploads()),
            PARTS_BUCKET => Ok(self.parts()),
            PROCESSED_BUCKET => Ok(self.processed()),
            other => bail!("bucket desconocido: {other}"),
        }
    }
}

pub async fn object_size(store: &dyn ObjectStore, key: &str) -> Result<u64> {
    let meta = store
        .head(&ObjectPath::from(key))
        .await
        .with_context(|| format!("head de {key}"))?;
    Ok(meta.size as u64)
}

/// Lee `range` del objeto. Un rango vacío no toca el store.
pub async fn read_range(store: &dyn ObjectStore, key: &str, range: ByteRange) -> Result<Bytes> {
    if range.is_empty() {
        return Ok(Bytes::new());
    }
    let start = usize::try_from(range.start).context("rango fuera de usize")?;
    let end = usize::try_from(range.end).context("rango fuera de usize")?;
    store
        .get_range(&ObjectPath::from(key), start..end)
        .await
        .with_context(|| format!("lectura de {} en {key}", range.to_header()))
}

pub async fn read_all(store: &dyn ObjectStore, key: &str) -> Result<Bytes> {
    read_object(store, &ObjectPath::from(key)).await
}

/// Igual que `read_all` pero sobre una ruta listada, sin volver a codificarla.
pub async fn read_object(store: &dyn ObjectStore, location: &ObjectPath) -> Result<Bytes> {
    let result = store
        .get(location)
        .await
        .with_context(|| format!("get de {location}"))?;
    Ok(result.bytes().await?)
}

/// Escritura con sobreescritura (idempotente por key).
pub async fn put_bytes(store: &dyn ObjectStore, key: &str, body: impl Into<PutPayload>) -> Result<()> {
    store
        .put(&ObjectPath::from(key), body.into())
        .await
        .with_context(|| format!("put de {key}"))?;
    Ok(())
}

/// Objetos bajo `prefix`, ordenados lexicográficamente.
///
/// Devuelve rutas y no strings: `location.to_string()` es la forma codificada
/// y pasarla de nuevo por `ObjectPath::from` codifica dos veces (`ñ`, `#`, `%`).
pub async fn list_objects(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<ObjectPath>> {
    let prefix = ObjectPath::from(prefix);
    let listed: Result<Vec<_>, _> = store.list(Some(&prefix)).try_collect().await;
    let metas = match listed {
        Ok(metas) => metas,
        // directorio todavía inexistente en LocalFileSystem
        Err(object_store::Error::NotFound { .. }) => Vec::new(),
        Err(e) => return Err(e).with_context(|| format!("list de {prefix}")),
    };

    let mut locations: Vec<ObjectPath> = metas.into_iter().map(|m| m.location).collect();
    locations.sort();
    Ok(locations)
}

/// Borra `key`. Devuelve false si ya no existía (borrar dos veces es un no-op).
pub async fn delete_if_exists(store: &dyn ObjectStore, key: &str) -> Result<bool> {
    delete_object(store, &ObjectPath::from(key)).await
}

pub async fn delete_object(store: &dyn ObjectStore, location: &ObjectPath) -> Result<bool> {
    match store.delete(location).await {
        Ok(()) => Ok(true),
        Err(object_store::Error::NotFound { .. }) => Ok(false),
        Err(e) => Err(e).with_context(|| format!("delete de {location}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_range_returns_exact_slice() {
        let storage = Storage::in_memory();
        put_bytes(storage.uploads(), "t/in.txt", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let got = read_range(storage.uploads(), "t/in.txt", ByteRange::new(2, 5))
            .await
            .unwrap();
        assert_eq!(&got[..], b"234");

        let empty = read_range(storage.uploads(), "t/in.txt", ByteRange::new(5, 5))
            .await
            .unwrap();
        assert!(empty.is_empty());

        assert_eq!(object_size(storage.uploads(), "t/in.txt").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn list_objects_is_scoped_to_task_namespace() {
        let storage = Storage::in_memory();
        for key in ["t1/part-000001.txt", "t1/part-000000.txt", "t10/part-000000.txt"] {
            put_bytes(storage.parts(), key, Bytes::from_static(b"x")).await.unwrap();
        }

        let keys: Vec<String> = list_objects(storage.parts(), "t1")
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys, vec!["t1/part-000000.txt", "t1/part-000001.txt"]);
        assert!(list_objects(storage.parts(), "nada").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listed_paths_read_and_delete_with_escaped_prefixes() {
        let (root, local) = local_tmp();
        let cases = [
            (Storage::in_memory(), vec!["ñandú", "job#1", "50%", "a b"]),
            (local, vec!["ñandú", "a b"]),
        ];
        for (storage, ids) in cases {
            for task_id in ids {
                let key = format!("{task_id}/part-000000.txt");
                put_bytes(storage.parts(), &key, "hola".to_string()).await.unwrap();

                let listed = list_objects(storage.parts(), task_id).await.unwrap();
                assert_eq!(listed.len(), 1, "listado de {task_id}");
                assert_eq!(listed[0], ObjectPath::from(key.as_str()));

                let body = read_object(storage.parts(), &listed[0]).await.unwrap();
                assert_eq!(&body[..], b"hola");

                assert!(delete_object(storage.parts(), &listed[0]).await.unwrap());
                assert!(list_objects(storage.parts(), task_id).await.unwrap().is_empty());
            }
        }
        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn delete_twice_is_a_noop() {
        let storage = Storage::in_memory();
        put_bytes(storage.processed(), "t/out.txt", Bytes::from_static(b"x"))
            .await
            .unwrap();
        delete_if_exists(storage.processed(), "t/out.txt").await.unwrap();
        delete_if_exists(storage.processed(), "t/out.txt").await.unwrap();
        assert!(read_all(storage.processed(), "t/out.txt").await.is_err());
    }

    fn local_tmp() -> (std::path::PathBuf, Storage) {
        let root = std::env::temp_dir()
            .join("fanout_storage_tests")
            .join(uuid::Uuid::new_v4().to_string());
        let storage = Storage::local(&root).unwrap();
        (root, storage)
    }

    #[tokio::test]
    async fn local_storage_lays_buckets_out_as_directories() {
        let (root, storage) = local_tmp();

        put_bytes(storage.bucket(PARTS_BUCKET).unwrap(), "t/part-000000.txt", "hola".to_string())
            .await
            .unwrap();
        assert!(root.join(PARTS_BUCKET).join("t").join("part-000000.txt").exists());
        assert!(!delete_if_exists(storage.parts(), "t/no-existe.txt").await.unwrap());
        assert!(storage.bucket("otro").is_err());

        let _ = std::fs::remove_dir_all(&root);
    }
}
