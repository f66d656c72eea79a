//! # Descriptor Registry
//!
//! A thread-safe store for protobuf file descriptors aggregated from many upstream
//! servers. The registry keeps three indexes that are kept consistent under a single
//! reader/writer lock:
//!
//! 1. file path -> [`FileDescriptorProto`]
//! 2. fully-qualified symbol name -> declaring file path
//! 3. containing message full name -> extension field number -> declaring file path
//!
//! Registration is idempotent on file path. When two upstreams register different
//! descriptors under the same path (protobuf forbids this, but broken deployments
//! exist), the last registration wins and the event is logged.
//!
//! Descriptors are never evicted; the registry grows monotonically even when the
//! upstream that contributed a file disappears, so reflection clients can keep
//! resolving types they have already seen.
use prost::Message;
use prost_types::{DescriptorProto, FieldDescriptorProto, FileDescriptorProto};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Error returned when a file, symbol or extension is not present in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("descriptor not found")]
pub struct NotFound;

/// The merged descriptor store backing the aggregated reflection service.
#[derive(Default)]
pub struct DescriptorRegistry {
    inner: RwLock<Indexes>,
}

#[derive(Default)]
struct Indexes {
    files: HashMap<String, Arc<FileDescriptorProto>>,
    symbols: HashMap<String, String>,
    extensions: HashMap<String, BTreeMap<i32, String>>,
}

impl DescriptorRegistry {
    /// Registers the given files, deduplicating by path.
    ///
    /// Reflection responses always contain a file together with its transitive
    /// dependencies, so registering a batch as returned by
    /// [`super::client::ReflectionClient::all_files_for_symbol`] keeps the registry
    /// transitively closed. Re-registering a byte-identical file is a no-op.
    pub fn register_files<I>(&self, files: I)
    where
        I: IntoIterator<Item = FileDescriptorProto>,
    {
        let mut inner = self.inner.write().unwrap();
        for fd in files {
            let path = fd.name().to_owned();
            if let Some(existing) = inner.files.get(&path) {
                if **existing == fd {
                    continue;
                }
                warn!(path = %path, "conflicting registration for proto file, replacing");
            }
            inner.index_file(path, fd);
        }
    }

    pub fn find_file_by_path(&self, path: &str) -> Result<Arc<FileDescriptorProto>, NotFound> {
        let inner = self.inner.read().unwrap();
        inner.files.get(path).cloned().ok_or(NotFound)
    }

    /// Looks up the file declaring the given fully-qualified symbol.
    ///
    /// Services, methods, messages (including nested ones), enums and extensions are
    /// all resolvable.
    pub fn find_file_containing_symbol(
        &self,
        symbol: &str,
    ) -> Result<Arc<FileDescriptorProto>, NotFound> {
        let inner = self.inner.read().unwrap();
        let path = inner.symbols.get(symbol).ok_or(NotFound)?;
        inner.files.get(path).cloned().ok_or(NotFound)
    }

    /// Looks up the file declaring the extension of `containing` with the given
    /// field number.
    pub fn find_file_containing_extension(
        &self,
        containing: &str,
        number: i32,
    ) -> Result<Arc<FileDescriptorProto>, NotFound> {
        let inner = self.inner.read().unwrap();
        let path = inner
            .extensions
            .get(containing)
            .and_then(|numbers| numbers.get(&number))
            .ok_or(NotFound)?;
        inner.files.get(path).cloned().ok_or(NotFound)
    }

    /// Returns the extension numbers of the given message, sorted ascending.
    ///
    /// Known messages without extensions yield an empty list; `NotFound` means the
    /// message itself is unknown.
    pub fn extension_numbers(&self, containing: &str) -> Result<Vec<i32>, NotFound> {
        let inner = self.inner.read().unwrap();
        let numbers = inner.extensions.get(containing).ok_or(NotFound)?;
        Ok(numbers.keys().copied().collect())
    }

    /// Returns the encoded root file and its transitive dependencies.
    ///
    /// Files already recorded in `sent` are suppressed, except that the root file is
    /// always included. Every returned file is added to `sent`. Imports that were
    /// never registered (placeholders) are skipped.
    pub fn files_with_dependencies(
        &self,
        root: &str,
        sent: &mut HashSet<String>,
    ) -> Result<Vec<Vec<u8>>, NotFound> {
        let inner = self.inner.read().unwrap();
        let root = inner.files.get(root).ok_or(NotFound)?;

        let mut encoded = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([Arc::clone(root)]);
        while let Some(fd) = queue.pop_front() {
            let path = fd.name();
            if !visited.insert(path.to_owned()) {
                continue;
            }

            if encoded.is_empty() || !sent.contains(path) {
                sent.insert(path.to_owned());
                encoded.push(fd.encode_to_vec());
            }

            for dep in &fd.dependency {
                if let Some(imported) = inner.files.get(dep) {
                    queue.push_back(Arc::clone(imported));
                }
            }
        }

        Ok(encoded)
    }
}

impl Indexes {
    fn index_file(&mut self, path: String, fd: FileDescriptorProto) {
        let package = fd.package().to_owned();

        for service in &fd.service {
            let service_name = scoped_name(&package, service.name());
            for method in &service.method {
                self.symbols
                    .insert(scoped_name(&service_name, method.name()), path.clone());
            }
            self.symbols.insert(service_name, path.clone());
        }

        for message in &fd.message_type {
            self.index_message(&package, message, &path);
        }

        for enum_type in &fd.enum_type {
            self.symbols
                .insert(scoped_name(&package, enum_type.name()), path.clone());
        }

        for extension in &fd.extension {
            self.index_extension(&package, extension, &path);
        }

        self.files.insert(path, Arc::new(fd));
    }

    fn index_message(&mut self, scope: &str, message: &DescriptorProto, path: &str) {
        let full_name = scoped_name(scope, message.name());
        self.symbols.insert(full_name.clone(), path.to_owned());

        // Seed the extension index so that a known message without extensions
        // resolves to an empty list instead of NotFound.
        self.extensions.entry(full_name.clone()).or_default();

        for nested in &message.nested_type {
            self.index_message(&full_name, nested, path);
        }
        for enum_type in &message.enum_type {
            self.symbols
                .insert(scoped_name(&full_name, enum_type.name()), path.to_owned());
        }
        for extension in &message.extension {
            self.index_extension(&full_name, extension, path);
        }
    }

    fn index_extension(&mut self, scope: &str, extension: &FieldDescriptorProto, path: &str) {
        self.symbols
            .insert(scoped_name(scope, extension.name()), path.to_owned());

        let extendee = extension.extendee().trim_start_matches('.').to_owned();
        self.extensions
            .entry(extendee)
            .or_default()
            .insert(extension.number(), path.to_owned());
    }
}

fn scoped_name(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_owned()
    } else {
        format!("{scope}.{name}")
    }
}
