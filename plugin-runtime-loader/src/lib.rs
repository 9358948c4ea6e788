//! # Plugin Runtime Loader
//!
//! The `PluginLoader` contract and the bundled `libloading`-backed default
//! implementation, plus a factory registry for alternate loader
//! implementations. A loaded plugin is expected to export two `extern "C"`
//! symbols: `create_plugin`, returning a heap-allocated trait object, and
//! `plugin_metadata_json`, returning its embedded metadata as a JSON string.

use std::collections::HashMap;
use std::ffi::CStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use plugin_runtime_core::{Plugin, PluginError, PluginErrorKind, PluginMetadata, PluginResult};
use tracing::{debug, info, warn};

/// Extensions the bundled loader recognizes.
pub const DEFAULT_EXTENSIONS: &[&str] = &[".so", ".dll", ".dylib", ".qtplugin"];

/// The entry point a dynamic library must export: returns a heap-allocated
/// plugin instance as a raw trait-object pointer. Ownership transfers to the
/// caller, who reconstitutes it with `Box::from_raw`.
pub type CreatePluginFn = unsafe extern "C" fn() -> *mut dyn Plugin;

/// The entry point returning the plugin's embedded metadata as a
/// NUL-terminated JSON C string. The loader never frees this pointer itself;
/// by convention the plugin returns a pointer to static storage.
pub type PluginMetadataFn = unsafe extern "C" fn() -> *const std::os::raw::c_char;

/// Abstraction that turns a file path into a live plugin instance plus its
/// metadata. The loader owns the OS handle to the native module; dropping a
/// loaded entry releases the handle.
pub trait PluginLoader: Send + Sync {
    fn can_load(&self, path: &Path) -> bool;
    fn supported_extensions(&self) -> Vec<String>;
    fn supports_hot_reload(&self) -> bool {
        false
    }
    fn read_metadata(&self, path: &Path) -> PluginResult<PluginMetadata>;
    fn load(&self, path: &Path) -> PluginResult<(Box<dyn Plugin>, String)>;
    fn unload(&self, plugin_id: &str) -> PluginResult<()>;
    fn is_loaded(&self, plugin_id: &str) -> bool;
    fn loaded_ids(&self) -> Vec<String>;
}

struct LoadedEntry {
    #[allow(dead_code)] // kept alive only for its Drop; never read again
    library: libloading::Library,
    file_path: PathBuf,
}

/// The bundled default implementation, backed by `libloading`. One process
/// may hold any number of `LibraryPluginLoader`s, but in practice the
/// manager owns a single instance for its whole lifetime.
#[derive(Default)]
pub struct LibraryPluginLoader {
    loaded: RwLock<HashMap<String, LoadedEntry>>,
}

impl LibraryPluginLoader {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_metadata_json(&self, path: &Path) -> PluginResult<String> {
        let library = unsafe {
            libloading::Library::new(path).map_err(|e| {
                PluginError::new(
                    PluginErrorKind::LoadFailed,
                    format!("failed to open library {}: {e}", path.display()),
                )
            })?
        };

        let metadata_fn: libloading::Symbol<PluginMetadataFn> = unsafe {
            library.get(b"plugin_metadata_json").map_err(|e| {
                PluginError::new(
                    PluginErrorKind::InvalidFormat,
                    format!("plugin does not export plugin_metadata_json: {e}"),
                )
            })?
        };

        let raw = unsafe { metadata_fn() };
        if raw.is_null() {
            return Err(PluginError::new(
                PluginErrorKind::InvalidFormat,
                "plugin_metadata_json returned a null pointer",
            ));
        }
        let json = unsafe { CStr::from_ptr(raw) }
            .to_str()
            .map_err(|e| {
                PluginError::new(
                    PluginErrorKind::InvalidFormat,
                    format!("plugin metadata is not valid UTF-8: {e}"),
                )
            })?
            .to_string();
        Ok(json)
    }
}

impl PluginLoader for LibraryPluginLoader {
    fn can_load(&self, path: &Path) -> bool {
        self.supported_extensions_match(path) && path.is_file()
    }

    fn supported_extensions(&self) -> Vec<String> {
        DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
    }

    fn read_metadata(&self, path: &Path) -> PluginResult<PluginMetadata> {
        let json = self.read_metadata_json(path)?;
        serde_json::from_str(&json).map_err(|e| {
            PluginError::new(
                PluginErrorKind::InvalidFormat,
                format!("malformed plugin metadata JSON: {e}"),
            )
        })
    }

    fn load(&self, path: &Path) -> PluginResult<(Box<dyn Plugin>, String)> {
        let metadata = self.read_metadata(path)?;
        if self.is_loaded(&metadata.id) {
            return Err(PluginError::new(
                PluginErrorKind::AlreadyLoaded,
                format!("plugin already loaded: {}", metadata.id),
            ));
        }

        let library = unsafe {
            libloading::Library::new(path).map_err(|e| {
                PluginError::new(
                    PluginErrorKind::LoadFailed,
                    format!("failed to open library {}: {e}", path.display()),
                )
            })?
        };

        let create_fn: libloading::Symbol<CreatePluginFn> = unsafe {
            library.get(b"create_plugin").map_err(|e| {
                PluginError::new(
                    PluginErrorKind::LoadFailed,
                    format!("plugin does not export create_plugin: {e}"),
                )
            })?
        };

        let raw = unsafe { create_fn() };
        if raw.is_null() {
            return Err(PluginError::new(
                PluginErrorKind::LoadFailed,
                "create_plugin returned a null pointer",
            ));
        }
        let plugin = unsafe { Box::from_raw(raw) };

        info!(plugin = %metadata.id, path = %path.display(), "loaded plugin library");
        self.loaded.write().insert(
            metadata.id.clone(),
            LoadedEntry {
                library,
                file_path: path.to_path_buf(),
            },
        );

        Ok((plugin, metadata.id))
    }

    fn unload(&self, plugin_id: &str) -> PluginResult<()> {
        match self.loaded.write().remove(plugin_id) {
            Some(entry) => {
                // Drop order: plugin object already released by the manager
                // before this is called; dropping `entry.library` here
                // unmaps the file last (plugin-object -> loader-entry ->
                // file-unmap).
                debug!(plugin = plugin_id, path = %entry.file_path.display(), "unloaded plugin library");
                Ok(())
            }
            None => Err(PluginError::new(
                PluginErrorKind::NotLoaded,
                format!("plugin not loaded: {plugin_id}"),
            )),
        }
    }

    fn is_loaded(&self, plugin_id: &str) -> bool {
        self.loaded.read().contains_key(plugin_id)
    }

    fn loaded_ids(&self) -> Vec<String> {
        self.loaded.read().keys().cloned().collect()
    }
}

impl LibraryPluginLoader {
    fn supported_extensions_match(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let dotted = format!(".{ext}");
        DEFAULT_EXTENSIONS
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&dotted))
    }
}

type LoaderFactoryFn = dyn Fn() -> Box<dyn PluginLoader> + Send + Sync;

/// Process-independent registry mapping a loader name to a constructor.
/// Owned per-instance so tests can construct an isolated manager without
/// touching global state.
#[derive(Default)]
pub struct LoaderFactory {
    constructors: RwLock<HashMap<String, Arc<LoaderFactoryFn>>>,
}

impl LoaderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, constructor: Arc<LoaderFactoryFn>) {
        self.constructors.write().insert(name.into(), constructor);
    }

    pub fn create(&self, name: &str) -> PluginResult<Box<dyn PluginLoader>> {
        self.constructors
            .read()
            .get(name)
            .map(|ctor| ctor())
            .ok_or_else(|| {
                PluginError::new(
                    PluginErrorKind::NotFound,
                    format!("no loader registered under name: {name}"),
                )
            })
    }

    /// The bundled dynamic-library loader, registered under `"default"`.
    pub fn create_default() -> Box<dyn PluginLoader> {
        Box::new(LibraryPluginLoader::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(suffix: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(suffix)
            .tempfile()
            .unwrap();
        file.write_all(b"not a real library").unwrap();
        file
    }

    #[test]
    fn recognizes_supported_extensions() {
        let loader = LibraryPluginLoader::new();
        assert_eq!(
            loader.supported_extensions(),
            vec![".so", ".dll", ".dylib", ".qtplugin"]
        );
        let ok = write_temp(".so");
        assert!(loader.can_load(ok.path()));

        let bad = write_temp(".exe");
        assert!(!loader.can_load(bad.path()));
    }

    #[test]
    fn load_fails_cleanly_on_non_library_file() {
        let loader = LibraryPluginLoader::new();
        let file = write_temp(".so");
        let err = loader.load(file.path()).unwrap_err();
        assert_eq!(err.code, PluginErrorKind::LoadFailed);
    }

    #[test]
    fn unload_unknown_plugin_fails() {
        let loader = LibraryPluginLoader::new();
        let err = loader.unload("nonexistent").unwrap_err();
        assert_eq!(err.code, PluginErrorKind::NotLoaded);
    }

    #[test]
    fn factory_creates_default_loader_by_name() {
        let factory = LoaderFactory::new();
        factory.register("default", Arc::new(|| LoaderFactory::create_default()));
        let loader = factory.create("default").unwrap();
        assert_eq!(loader.supported_extensions().len(), 4);
        assert!(factory.create("missing").is_err());
    }
}
