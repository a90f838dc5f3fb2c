use std::sync::Arc;
use tracing::{debug, error};

use crate::packager::Packager;

/// Disparo asíncrono del packager. Quien invoca no espera el resultado.
pub trait Invoker: Send + Sync {
    fn invoke_packager(&self, task_id: &str);
}

/// Corre el packager en una tarea de tokio aparte.
pub struct SpawnInvoker {
    packager: Arc<Packager>,
}

impl SpawnInvoker {
    pub fn new(packager: Arc<Packager>) -> Self {
        Self { packager }
    }
}

impl Invoker for SpawnInvoker {
    fn invoke_packager(&self, task_id: &str) {
        let packager = self.packager.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            match packager.run(&task_id).await {
                Ok(outcome) => debug!("packager de la tarea {}: {:?}", task_id, outcome),
                Err(e) => error!("packager de la tarea {} falló: {:#}", task_id, e),
            }
        });
    }
}
