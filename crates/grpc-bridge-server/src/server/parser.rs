//! Service discovery from `.proto` files.
//!
//! The file is compiled with `protoc` into a `FileDescriptorSet` and loaded
//! with `prost-reflect`. Only services declared in the file itself are
//! returned; imported files contribute message types but no services.

use prost::Message as _;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to locate protoc binary: {0}")]
    ProtocBin(String),

    #[error("failed to run protoc: {0}")]
    ProtocIo(#[from] std::io::Error),

    #[error("protoc failed (exit={exit}): {stderr}")]
    ProtocFailed { exit: i32, stderr: String },

    #[error("failed to build descriptor pool: {0}")]
    DescriptorPool(#[from] prost_reflect::DescriptorError),

    #[error("failed to decode FileDescriptorSet: {0}")]
    DescriptorDecode(#[from] prost::DecodeError),

    #[error("descriptor set is empty")]
    EmptyDescriptorSet,
}

/// A unary-capable service declared in a `.proto` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub package: String,
    pub name: String,
    /// Unary method names in declaration order.
    pub methods: Vec<String>,
}

impl ServiceDescriptor {
    /// `package.Service`, or just `Service` without a package.
    pub fn full_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }
}

/// Compiles `.proto` files with `protoc`.
#[derive(Debug, Clone, Default)]
pub struct ProtoParser {
    include_paths: Vec<PathBuf>,
}

impl ProtoParser {
    pub fn new(include_paths: Vec<PathBuf>) -> Self {
        Self { include_paths }
    }

    fn resolve_protoc() -> Result<OsString, ParseError> {
        if let Some(p) = std::env::var_os("PROTOC").filter(|v| !v.is_empty()) {
            return Ok(p);
        }

        match Command::new("protoc").arg("--version").output() {
            Ok(out) if out.status.success() => Ok(OsString::from("protoc")),
            _ => Err(ParseError::ProtocBin(
                "no runnable protoc found; install protoc and ensure it's on PATH, or set PROTOC=/path/to/protoc"
                    .to_string(),
            )),
        }
    }

    /// Returns the services declared in `proto_file`, in declaration order.
    ///
    /// # Errors
    ///
    /// Fails if `protoc` is missing or rejects the file, or if the produced
    /// descriptors cannot be loaded.
    pub fn parse_file(&self, proto_file: &Path) -> Result<Vec<ServiceDescriptor>, ParseError> {
        let mut include_paths = self.include_paths.clone();
        if let Some(dir) = proto_file.parent().filter(|d| !d.as_os_str().is_empty()) {
            include_paths.push(dir.to_path_buf());
        } else {
            include_paths.push(PathBuf::from("."));
        }

        let protoc = Self::resolve_protoc()?;
        let out = tempfile::NamedTempFile::new()?;

        let mut cmd = Command::new(protoc);
        cmd.arg("--include_imports")
            .arg(format!("--descriptor_set_out={}", out.path().display()));
        for p in &include_paths {
            cmd.arg("-I").arg(p);
        }
        cmd.arg(proto_file);

        let output = cmd.output()?;
        if !output.status.success() {
            let exit = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            return Err(ParseError::ProtocFailed { exit, stderr });
        }

        let bytes = std::fs::read(out.path())?;
        let fds = FileDescriptorSet::decode(bytes.as_slice())?;
        services_from_descriptor_set(fds)
    }
}

/// Extracts the services of the target file of a descriptor set.
///
/// `protoc --include_imports` lists dependencies first, so the target is the
/// last file. Streaming methods are skipped.
///
/// # Errors
///
/// Fails on an empty or unresolvable descriptor set.
pub fn services_from_descriptor_set(
    fds: FileDescriptorSet,
) -> Result<Vec<ServiceDescriptor>, ParseError> {
    let target = fds
        .file
        .last()
        .and_then(|f| f.name.clone())
        .ok_or(ParseError::EmptyDescriptorSet)?;

    let pool = DescriptorPool::from_file_descriptor_set(fds)?;
    let Some(file) = pool.get_file_by_name(&target) else {
        return Err(ParseError::EmptyDescriptorSet);
    };

    let services = file
        .services()
        .map(|service| {
            let methods = service
                .methods()
                .filter(|m| {
                    let streaming = m.is_client_streaming() || m.is_server_streaming();
                    if streaming {
                        tracing::warn!(
                            service = service.full_name(),
                            method = m.name(),
                            "skipping streaming method"
                        );
                    }
                    !streaming
                })
                .map(|m| m.name().to_owned())
                .collect();

            ServiceDescriptor {
                package: service.package_name().to_owned(),
                name: service.name().to_owned(),
                methods,
            }
        })
        .collect();

    Ok(services)
}
