//! # Plugin Runtime Security
//!
//! Stateless-per-call validation pipeline gating plugin admission, plus a
//! persistent trust store mapping plugin ids to pre-approved security
//! levels. Validation runs as a staged accumulation of errors and warnings
//! with early return on the first hard failure.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use plugin_runtime_core::{Capability, PluginError, PluginErrorKind, PluginMetadata, PluginResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Security levels, ordered from least to most restrictive. Each level runs
/// every lower level's checks plus its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityLevel {
    None,
    Basic,
    Standard,
    Strict,
    Maximum,
}

impl SecurityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityLevel::None => "None",
            SecurityLevel::Basic => "Basic",
            SecurityLevel::Standard => "Standard",
            SecurityLevel::Strict => "Strict",
            SecurityLevel::Maximum => "Maximum",
        }
    }

    /// Unknown strings default to `Basic`.
    pub fn from_str_or_basic(s: &str) -> Self {
        match s {
            "None" => SecurityLevel::None,
            "Basic" => SecurityLevel::Basic,
            "Standard" => SecurityLevel::Standard,
            "Strict" => SecurityLevel::Strict,
            "Maximum" => SecurityLevel::Maximum,
            _ => SecurityLevel::Basic,
        }
    }
}

/// Result of running the validation pipeline against one file.
#[derive(Debug, Clone, Default)]
pub struct SecurityValidationResult {
    pub is_valid: bool,
    pub validated_level: Option<SecurityLevel>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl SecurityValidationResult {
    fn fail(mut self, error: impl Into<String>) -> Self {
        self.is_valid = false;
        self.errors.push(error.into());
        self
    }
}

/// Pluggable signature verification, left as a policy decision for the
/// embedding host. The default implementation always passes and warns
/// that verification is not implemented.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, file_path: &Path) -> PluginResult<()>;

    /// Whether this verifier is a non-cryptographic stub. `validate_signature`
    /// surfaces this as a warning on every successful check rather than
    /// silently treating a passed stub the same as a passed real verifier.
    fn is_permissive(&self) -> bool {
        false
    }
}

pub struct PermissiveSignatureVerifier;

impl SignatureVerifier for PermissiveSignatureVerifier {
    fn verify(&self, file_path: &Path) -> PluginResult<()> {
        warn!(
            path = %file_path.display(),
            "signature verification not implemented"
        );
        Ok(())
    }

    fn is_permissive(&self) -> bool {
        true
    }
}

/// Persistent mapping from plugin id to the security level at which that
/// plugin has been pre-approved. Protected by a single reader/writer lock.
pub struct TrustStore {
    entries: RwLock<HashMap<String, SecurityLevel>>,
}

#[derive(Serialize, Deserialize)]
struct TrustStoreFile {
    version: String,
    trusted_plugins: Vec<TrustEntryFile>,
}

#[derive(Serialize, Deserialize)]
struct TrustEntryFile {
    id: String,
    trust_level: String,
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, plugin_id: &str, level: SecurityLevel) {
        self.entries.write().insert(plugin_id.to_string(), level);
    }

    pub fn remove(&self, plugin_id: &str) {
        self.entries.write().remove(plugin_id);
    }

    pub fn lookup(&self, plugin_id: &str) -> Option<SecurityLevel> {
        self.entries.read().get(plugin_id).copied()
    }

    pub fn is_trusted(&self, plugin_id: &str) -> bool {
        self.entries.read().contains_key(plugin_id)
    }

    /// Load `{"version":"1.0","trusted_plugins":[{"id":..,"trust_level":..}]}`,
    /// replacing the current contents. Unknown keys are ignored; invalid
    /// trust levels default to `Basic`.
    pub fn load(&self, path: &Path) -> PluginResult<()> {
        if !path.exists() {
            return Err(PluginError::new(
                PluginErrorKind::FileNotFound,
                format!("trust store file not found: {}", path.display()),
            ));
        }
        let content = fs::read_to_string(path).map_err(|e| {
            PluginError::new(PluginErrorKind::FileSystemError, e.to_string())
        })?;
        let parsed: TrustStoreFile = serde_json::from_str(&content).map_err(|e| {
            PluginError::new(PluginErrorKind::ConfigurationError, e.to_string())
        })?;

        let mut entries = self.entries.write();
        entries.clear();
        for entry in parsed.trusted_plugins {
            entries.insert(entry.id, SecurityLevel::from_str_or_basic(&entry.trust_level));
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> PluginResult<()> {
        let trusted_plugins: Vec<TrustEntryFile> = self
            .entries
            .read()
            .iter()
            .map(|(id, level)| TrustEntryFile {
                id: id.clone(),
                trust_level: level.as_str().to_string(),
            })
            .collect();
        let file = TrustStoreFile {
            version: "1.0".to_string(),
            trusted_plugins,
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| {
            PluginError::new(PluginErrorKind::ConfigurationError, e.to_string())
        })?;
        fs::write(path, json)
            .map_err(|e| PluginError::new(PluginErrorKind::FileSystemError, e.to_string()))
    }
}

/// Configuration controlling which checks the validator runs.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub level: SecurityLevel,
    pub signature_verification_enabled: bool,
    pub allowed_extensions: Vec<String>,
    pub max_file_size_bytes: u64,
    pub allowed_capabilities: Option<Vec<Capability>>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Standard,
            signature_verification_enabled: false,
            allowed_extensions: vec![
                ".so".to_string(),
                ".dll".to_string(),
                ".dylib".to_string(),
                ".qtplugin".to_string(),
            ],
            max_file_size_bytes: 100 * 1024 * 1024,
            allowed_capabilities: None,
        }
    }
}

/// Stateless (per validation) pipeline that gates plugin admission: file
/// integrity → metadata → signature → permissions.
pub struct SecurityValidator {
    config: SecurityConfig,
    trust_store: TrustStore,
    signature_verifier: Box<dyn SignatureVerifier>,
    validations_performed: AtomicU64,
    validations_passed: AtomicU64,
    validations_failed: AtomicU64,
}

impl SecurityValidator {
    pub fn new(config: SecurityConfig) -> Self {
        info!(level = ?config.level, "initializing security validator");
        Self {
            config,
            trust_store: TrustStore::new(),
            signature_verifier: Box::new(PermissiveSignatureVerifier),
            validations_performed: AtomicU64::new(0),
            validations_passed: AtomicU64::new(0),
            validations_failed: AtomicU64::new(0),
        }
    }

    pub fn with_signature_verifier(mut self, verifier: Box<dyn SignatureVerifier>) -> Self {
        self.signature_verifier = verifier;
        self
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust_store
    }

    pub fn level(&self) -> SecurityLevel {
        self.config.level
    }

    pub fn set_level(&mut self, level: SecurityLevel) {
        self.config.level = level;
    }

    /// Run the pipeline stages up to `self.config.level` against `file_path`,
    /// optionally checking metadata once it has been read by the loader.
    pub fn validate(
        &self,
        file_path: &Path,
        metadata: Option<&PluginMetadata>,
    ) -> SecurityValidationResult {
        self.validations_performed.fetch_add(1, Ordering::Relaxed);

        let mut result = SecurityValidationResult::default();

        let basic = self.validate_file_integrity(file_path);
        if !basic.is_valid {
            result.errors.extend(basic.errors);
            self.validations_failed.fetch_add(1, Ordering::Relaxed);
            return result;
        }
        result.warnings.extend(basic.warnings);
        result.validated_level = Some(SecurityLevel::Basic);

        if self.config.level >= SecurityLevel::Standard {
            let metadata_check = self.validate_metadata(metadata);
            if !metadata_check.is_valid {
                result.errors.extend(metadata_check.errors);
                self.validations_failed.fetch_add(1, Ordering::Relaxed);
                return result;
            }
            result.warnings.extend(metadata_check.warnings);

            if self.config.signature_verification_enabled {
                let signature_check = self.validate_signature(file_path);
                if !signature_check.is_valid {
                    result.errors.extend(signature_check.errors);
                    self.validations_failed.fetch_add(1, Ordering::Relaxed);
                    return result;
                }
                result.warnings.extend(signature_check.warnings);
            }
            result.validated_level = Some(SecurityLevel::Standard);
        }

        if self.config.level >= SecurityLevel::Strict {
            let permission_check = self.validate_permissions(metadata);
            if !permission_check.is_valid {
                result.errors.extend(permission_check.errors);
                self.validations_failed.fetch_add(1, Ordering::Relaxed);
                return result;
            }
            result.warnings.extend(permission_check.warnings);
            result.validated_level = Some(SecurityLevel::Strict);
        }

        if self.config.level >= SecurityLevel::Maximum {
            if !result.warnings.is_empty() {
                let warnings = std::mem::take(&mut result.warnings);
                result.errors.extend(warnings);
                self.validations_failed.fetch_add(1, Ordering::Relaxed);
                return result;
            }
            result.validated_level = Some(SecurityLevel::Maximum);
        }

        result.is_valid = true;
        self.validations_passed.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn validate_file_integrity(&self, file_path: &Path) -> SecurityValidationResult {
        let mut result = SecurityValidationResult::default();

        if !is_safe_path(file_path) {
            return result.fail("unsafe file path");
        }
        if !self.has_allowed_extension(file_path) {
            return result.fail("Invalid file extension");
        }
        if !file_path.exists() {
            return result.fail("file does not exist");
        }
        let meta = match fs::metadata(file_path) {
            Ok(m) => m,
            Err(_) => return result.fail("file is not readable"),
        };
        if !meta.is_file() {
            return result.fail("path is not a regular file");
        }
        let size = meta.len();
        if size == 0 {
            return result.fail("file is empty");
        }
        if size > self.config.max_file_size_bytes {
            if self.config.level >= SecurityLevel::Maximum {
                return result.fail("file exceeds the maximum allowed size");
            }
            result.warnings.push("file is very large".to_string());
        }

        result.is_valid = true;
        result
    }

    fn validate_metadata(&self, metadata: Option<&PluginMetadata>) -> SecurityValidationResult {
        let mut result = SecurityValidationResult::default();
        match metadata {
            Some(m) if !m.id.is_empty() && !m.name.is_empty() => {
                result.is_valid = true;
            }
            Some(_) => {
                return result.fail("metadata is missing required fields");
            }
            None => {
                return result.fail("no metadata available to validate");
            }
        }
        result
    }

    fn validate_signature(&self, file_path: &Path) -> SecurityValidationResult {
        let mut result = SecurityValidationResult::default();
        match self.signature_verifier.verify(file_path) {
            Ok(()) => {
                result.is_valid = true;
                if self.signature_verifier.is_permissive() {
                    result
                        .warnings
                        .push("signature verification not implemented".to_string());
                }
            }
            Err(e) => {
                return result.fail(format!("signature verification failed: {e}"));
            }
        }
        result
    }

    fn validate_permissions(&self, metadata: Option<&PluginMetadata>) -> SecurityValidationResult {
        let mut result = SecurityValidationResult::default();
        let Some(allowed) = &self.config.allowed_capabilities else {
            result.is_valid = true;
            return result;
        };
        let Some(metadata) = metadata else {
            result.is_valid = true;
            return result;
        };
        let escalated: Vec<_> = metadata
            .capabilities
            .iter()
            .filter(|c| !allowed.contains(c))
            .collect();
        if !escalated.is_empty() {
            warn!(plugin = %metadata.id, "plugin requests capabilities outside the allowed set");
            return result.fail("plugin requests capabilities beyond the host-imposed allowed set");
        }
        result.is_valid = true;
        result
    }

    fn has_allowed_extension(&self, file_path: &Path) -> bool {
        let Some(ext) = file_path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let dotted = format!(".{ext}");
        self.config
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&dotted))
    }

    pub fn statistics(&self) -> serde_json::Value {
        serde_json::json!({
            "validations_performed": self.validations_performed.load(Ordering::Relaxed),
            "validations_passed": self.validations_passed.load(Ordering::Relaxed),
            "validations_failed": self.validations_failed.load(Ordering::Relaxed),
            "current_security_level": self.config.level.as_str(),
            "signature_verification_enabled": self.config.signature_verification_enabled,
        })
    }
}

fn is_safe_path(file_path: &Path) -> bool {
    let s = file_path.to_string_lossy();
    if s.contains("..") {
        return false;
    }
    !s.chars().any(|c| "<>:\"|?*".contains(c))
}
