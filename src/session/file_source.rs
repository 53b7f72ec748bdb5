// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Outbound object access: the source seam, file-name derivation, and the
//! background reader that feeds body chunks to the protocol task.
//!
//! Reads are blocking and therefore never run on the protocol task. The
//! worker serves one read at a time and posts each chunk back through a
//! message; ownership of the bytes moves with the post.

use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::mpsc,
    thread,
};

use anyhow::{Result, bail};
use bytes::Bytes;
use tracing::warn;

/// One object queued for pushing. Metadata is cheap and read up front; the
/// byte stream is opened lazily and consumed on the reader worker.
pub trait SourceObject: Send + 'static {
    /// Declared name, if the object has one.
    fn name(&self) -> Option<String>;

    /// MIME type, `application/octet-stream` when unknown.
    fn mime_type(&self) -> String;

    /// Declared size in bytes; drives the Length header and PutFinal timing.
    fn size(&self) -> u64;

    /// Open the byte stream. Called once per object, lazily.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
}

/// Maps a MIME type to its primary file extension, the service the engine
/// asks when a pushed object has no extension of its own.
pub trait MimeResolver: Send + Sync {
    fn primary_extension(&self, mime: &str) -> Option<String>;
}

/// Table-driven resolver covering the types OPP peers commonly push.
#[derive(Debug, Default)]
pub struct StaticMimeResolver;

impl MimeResolver for StaticMimeResolver {
    fn primary_extension(&self, mime: &str) -> Option<String> {
        let ext = match mime.to_ascii_lowercase().as_str() {
            "text/plain" => "txt",
            "text/html" => "html",
            "text/x-vcard" | "text/vcard" => "vcf",
            "text/calendar" => "ics",
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/gif" => "gif",
            "image/bmp" => "bmp",
            "audio/mpeg" => "mp3",
            "audio/mp4" => "m4a",
            "audio/ogg" => "ogg",
            "video/mp4" => "mp4",
            "video/3gpp" => "3gp",
            "application/pdf" => "pdf",
            "application/zip" => "zip",
            _ => return None,
        };
        Some(ext.to_owned())
    }
}

/// Derive the file name announced to the peer: the declared name (or
/// `"Unknown"`), stripped of any path prefix, with a MIME-derived extension
/// appended when none remains.
pub fn name_hint(object: &dyn SourceObject, mime: &dyn MimeResolver) -> String {
    let mut name = object.name().unwrap_or_default();
    if name.is_empty() {
        name = "Unknown".to_owned();
    }

    if let Some(pos) = name.rfind('/') {
        name = name[pos + 1..].to_owned();
    }

    if !name.contains('.')
        && let Some(ext) = mime.primary_extension(&object.mime_type())
    {
        name.push('.');
        name.push_str(&ext);
    }

    name
}

/// `SourceObject` over a local file; used by the demo binary and tests.
#[derive(Debug, Clone)]
pub struct FileSourceObject {
    path: PathBuf,
    size: u64,
    mime: String,
}

impl FileSourceObject {
    pub fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let size = std::fs::metadata(&path)?.len();
        let mime = guess_mime(&path);
        Ok(Self { path, size, mime })
    }
}

fn guess_mime(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "vcf" => "text/x-vcard",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
    .to_owned()
}

impl SourceObject for FileSourceObject {
    fn name(&self) -> Option<String> {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_owned)
    }

    fn mime_type(&self) -> String {
        self.mime.clone()
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }
}

enum ReadCommand {
    Open(Box<dyn Read + Send>),
    Read { max: usize },
    Close,
}

/// Dedicated thread that owns the current object's byte stream. One read is
/// in flight at a time; each completed chunk is posted back to the protocol
/// task through the supplied closure.
pub struct ReaderWorker {
    tx: Option<mpsc::Sender<ReadCommand>>,
    join: Option<thread::JoinHandle<()>>,
}

impl ReaderWorker {
    pub fn spawn<F>(post: F) -> Self
    where F: Fn(io::Result<Bytes>) + Send + 'static {
        let (tx, rx) = mpsc::channel::<ReadCommand>();

        let join = thread::Builder::new()
            .name("opp-reader".to_owned())
            .spawn(move || {
                let mut stream: Option<Box<dyn Read + Send>> = None;
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        ReadCommand::Open(s) => stream = Some(s),
                        ReadCommand::Close => stream = None,
                        ReadCommand::Read { max } => {
                            let res = match stream.as_mut() {
                                Some(s) => {
                                    let mut buf = vec![0u8; max];
                                    s.read(&mut buf).map(|n| {
                                        buf.truncate(n);
                                        Bytes::from(buf)
                                    })
                                },
                                None => Err(io::Error::new(
                                    io::ErrorKind::NotConnected,
                                    "no stream opened",
                                )),
                            };
                            post(res);
                        },
                    }
                }
            })
            .ok();

        if join.is_none() {
            warn!("failed to spawn reader worker thread");
        }

        Self { tx: Some(tx), join }
    }

    /// Hand the worker the stream for the next object.
    pub fn open(&self, stream: Box<dyn Read + Send>) -> Result<()> {
        let Some(tx) = &self.tx else { bail!("reader worker is gone") };
        if tx.send(ReadCommand::Open(stream)).is_err() {
            bail!("reader worker went away");
        }
        Ok(())
    }

    /// Ask for up to `max` bytes of the current stream.
    pub fn request(&self, max: usize) -> Result<()> {
        let Some(tx) = &self.tx else { bail!("reader worker is gone") };
        if tx.send(ReadCommand::Read { max }).is_err() {
            bail!("reader worker went away");
        }
        Ok(())
    }

    /// Drop the current stream without tearing the worker down.
    pub fn close_stream(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(ReadCommand::Close);
        }
    }
}

impl Drop for ReaderWorker {
    fn drop(&mut self) {
        self.tx = None;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
