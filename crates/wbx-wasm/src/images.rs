//! Compiled tool images, kept in memory and optionally as precompiled
//! artifacts on disk.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use wasmtime::{Engine, Module};
use wbx_cbor::Digest;

const WASMTIME_VERSION: &str = "36.0.3";
const ARTIFACT_EXT: &str = "cwasm";

pub(crate) struct ImageCache {
    compiled: Mutex<HashMap<Digest, Arc<Module>>>,
    /// `<root>/<engine tag>`; artifacts from another engine setup never
    /// land in the same directory.
    dir: Option<PathBuf>,
}

impl ImageCache {
    pub(crate) fn new(root: Option<PathBuf>) -> Result<Self> {
        let dir = match root {
            Some(root) => {
                let dir = root.join(engine_tag());
                fs::create_dir_all(&dir)
                    .with_context(|| format!("create image cache {}", dir.display()))?;
                Some(dir)
            }
            None => None,
        };
        Ok(Self {
            compiled: Mutex::new(HashMap::new()),
            dir,
        })
    }

    pub(crate) fn get_or_compile(&self, engine: &Engine, image: &[u8]) -> Result<Arc<Module>> {
        let id = Digest::sha256_of(image);
        if let Some(module) = self.lock().get(&id) {
            return Ok(module.clone());
        }

        let module = match self.read_artifact(engine, &id) {
            Some(module) => {
                log::debug!("tool image {id} loaded precompiled");
                module
            }
            None => {
                let module = Arc::new(Module::new(engine, image).context("compile tool image")?);
                if let Err(err) = self.write_artifact(&id, &module) {
                    log::warn!("could not save precompiled tool image {id}: {err:#}");
                }
                module
            }
        };
        Ok(self.lock().entry(id).or_insert(module).clone())
    }

    pub(crate) fn artifact_path(&self, id: &Digest) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{id}.{ARTIFACT_EXT}")))
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Digest, Arc<Module>>> {
        self.compiled.lock().expect("image cache poisoned")
    }

    fn read_artifact(&self, engine: &Engine, id: &Digest) -> Option<Arc<Module>> {
        let path = self.artifact_path(id)?;
        let bytes = fs::read(&path).ok()?;
        // SAFETY: the directory is named for this engine setup and only
        // `write_artifact` puts files there.
        match unsafe { Module::deserialize(engine, &bytes) } {
            Ok(module) => Some(Arc::new(module)),
            Err(err) => {
                log::warn!("discarding unusable artifact {}: {err}", path.display());
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn write_artifact(&self, id: &Digest, module: &Module) -> Result<()> {
        let Some(path) = self.artifact_path(id) else {
            return Ok(());
        };
        let bytes = module.serialize().context("serialize tool image")?;
        let tmp = path.with_extension(format!("{ARTIFACT_EXT}.tmp"));
        fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename to {}", path.display()))
    }
}

/// Stable name for the engine setup built by `crate::engine_config`.
fn engine_tag() -> String {
    let setup = format!(
        "wasmtime-{WASMTIME_VERSION}/{}-{}/multi-value,ref-types,no-threads,no-debug",
        std::env::consts::ARCH,
        std::env::consts::OS,
    );
    let digest = Digest::sha256_of(setup.as_bytes());
    format!("engine-{}", &digest.as_str()[..16])
}
