// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Inbound object storage: unique-named sinks under the download directory,
//! FAT-safe file names, and the removable-volume mount lock.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;

/// Subdirectory every received object lands in, relative to the store root.
pub const TARGET_SUBDIR: &str = "Download/Bluetooth";

/// Volume that must stay mounted while an inbound transfer runs.
pub const MOUNT_LOCK_VOLUME: &str = "sdcard";

/// Characters the FAT file system cannot carry; replaced with `_`.
fn is_reserved_char(c: char) -> bool {
    c < '\u{20}'
        || matches!(c, '?' | '|' | '<' | '>' | '"' | ':' | '/' | '*' | '\\')
}

/// Replace every reserved character of `name` with an underscore.
pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| if is_reserved_char(c) { '_' } else { c })
        .collect()
}

/// An open sink for one inbound object.
pub trait FileSink: Send {
    /// Leaf name actually chosen, after collision suffixing.
    fn file_name(&self) -> &str;

    /// Descriptor handed to `file-watcher-notify` after a finalize.
    fn path(&self) -> &Path;

    /// Write all of `data` or fail.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Close the handle, keeping the file.
    fn finalize(&mut self) -> io::Result<()>;

    /// Close the handle and remove the partial file.
    fn discard(&mut self) -> io::Result<()>;
}

/// Creates uniquely named sinks inside a fixed target subdirectory.
pub trait FileStore: Send + Sync {
    fn create_unique(&self, name: &str) -> io::Result<Box<dyn FileSink>>;
}

/// `FileStore` over the local file system, rooted at a base directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target_dir(&self) -> PathBuf {
        self.root.join(TARGET_SUBDIR)
    }
}

impl FileStore for LocalFileStore {
    fn create_unique(&self, name: &str) -> io::Result<Box<dyn FileSink>> {
        let dir = self.target_dir();
        fs::create_dir_all(&dir)?;

        let (stem, ext) = split_name(name);
        for attempt in 0..1000u32 {
            let leaf = if attempt == 0 {
                name.to_owned()
            } else if ext.is_empty() {
                format!("{stem}-{attempt}")
            } else {
                format!("{stem}-{attempt}.{ext}")
            };
            let path = dir.join(&leaf);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(Box::new(LocalFileSink {
                        file: Some(file),
                        leaf,
                        path,
                    }));
                },
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free name for {name:?} in {dir:?}"),
        ))
    }
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, ext),
        _ => (name, ""),
    }
}

struct LocalFileSink {
    file: Option<File>,
    leaf: String,
    path: PathBuf,
}

impl FileSink for LocalFileSink {
    fn file_name(&self) -> &str {
        &self.leaf
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(data),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "sink closed")),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn discard(&mut self) -> io::Result<()> {
        self.file = None;
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Opaque token keeping the removable volume mounted; released on drop.
pub trait MountLock: Send {}

/// Hands out mount locks for named volumes.
pub trait MountLockBroker: Send + Sync {
    fn acquire(&self, volume: &str) -> Result<Box<dyn MountLock>>;
}

/// Broker for hosts without removable storage; always succeeds.
#[derive(Debug, Default)]
pub struct NoopMountLockBroker;

struct NoopMountLock;

impl MountLock for NoopMountLock {}

impl MountLockBroker for NoopMountLockBroker {
    fn acquire(&self, _volume: &str) -> Result<Box<dyn MountLock>> {
        Ok(Box::new(NoopMountLock))
    }
}
