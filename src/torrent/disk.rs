use std::{
    error::Error,
    fmt::Display,
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error};

use crate::torrent::events::Event;

/// Commands the disk actor processes.
#[derive(Debug)]
pub enum DiskCommand {
    /// Write a downloaded block at its final position.
    WriteBlock {
        piece_index: u32,
        begin: u32,
        data: Vec<u8>,
    },

    /// Read a block a remote peer requested; answered with a
    /// `BlockRead` event tagged with the requesting peer.
    ReadBlock {
        addr: String,
        piece_index: u32,
        begin: u32,
        length: u32,
    },

    /// Hash a fully downloaded piece against its expected digest. The
    /// command carries everything needed, so the actor holds no piece
    /// table of its own.
    VerifyPiece {
        piece_index: u32,
        length: u32,
        expected: [u8; 20],
    },

    /// Sync all file contents to stable storage.
    Flush,

    /// Query current I/O statistics.
    QueryStats(mpsc::Sender<DiskStats>),

    Shutdown,
}

#[derive(Debug, Clone, Default)]
pub struct DiskStats {
    pub bytes_written: u64,
    pub blocks_written: u64,
    pub bytes_read: u64,
    pub write_errors: u32,
}

/// One file of the torrent, at its cumulative offset within the piece
/// space.
#[derive(Debug)]
struct FileSpan {
    path: PathBuf,
    offset: u64,
    length: u64,
}

/// Actor owning all file I/O for one torrent. Blocks and pieces address a
/// flat byte space; the actor maps that space onto the torrent's files,
/// splitting writes and reads that straddle a file boundary.
#[derive(Debug)]
pub struct Disk {
    spans: Vec<FileSpan>,
    piece_length: u64,
    total_length: u64,
    stats: DiskStats,
    event_tx: mpsc::Sender<Event>,
}

impl Disk {
    /// `files` is the torrent's file layout as relative paths with
    /// lengths, laid out under `root` in order.
    pub fn new(
        root: PathBuf,
        files: Vec<(PathBuf, u64)>,
        piece_length: u64,
        total_length: u64,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        let mut spans = Vec::with_capacity(files.len());
        let mut offset = 0u64;
        for (relative, length) in files {
            spans.push(FileSpan {
                path: root.join(relative),
                offset,
                length,
            });
            offset += length;
        }

        Self {
            spans,
            piece_length,
            total_length,
            stats: DiskStats::default(),
            event_tx,
        }
    }

    pub fn run(mut self) -> (mpsc::Sender<DiskCommand>, JoinHandle<()>) {
        let (command_tx, mut command_rx) = mpsc::channel(100);

        let handle = tokio::spawn(async move {
            let mut files = match self.open_files() {
                Ok(files) => files,
                Err(e) => {
                    error!(error = %e, "Failed to open download files");
                    return;
                }
            };

            while let Some(command) = command_rx.recv().await {
                match command {
                    DiskCommand::WriteBlock {
                        piece_index,
                        begin,
                        data,
                    } => {
                        debug!(piece_index, begin, size = data.len(), "Writing block");
                        let offset = self.block_offset(piece_index, begin);
                        match self.write_at(&mut files, offset, &data) {
                            Ok(()) => {
                                self.stats.bytes_written += data.len() as u64;
                                self.stats.blocks_written += 1;
                            }
                            Err(e) => {
                                error!(piece_index, begin, error = %e, "Failed to write block");
                                self.stats.write_errors += 1;
                                let event = Event::BlockWriteFailed { piece_index, begin };
                                if self.event_tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    DiskCommand::ReadBlock {
                        addr,
                        piece_index,
                        begin,
                        length,
                    } => {
                        let offset = self.block_offset(piece_index, begin);
                        let mut data = vec![0u8; length as usize];
                        let event = match self.read_at(&mut files, offset, &mut data) {
                            Ok(()) => {
                                self.stats.bytes_read += length as u64;
                                Event::BlockRead {
                                    addr,
                                    piece_index,
                                    begin,
                                    data,
                                }
                            }
                            Err(e) => {
                                error!(piece_index, begin, error = %e, "Failed to read block");
                                Event::BlockReadFailed {
                                    addr,
                                    piece_index,
                                    begin,
                                }
                            }
                        };
                        if self.event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    DiskCommand::VerifyPiece {
                        piece_index,
                        length,
                        expected,
                    } => {
                        let valid = match self.hash_piece(&mut files, piece_index, length) {
                            Ok(digest) => digest == expected,
                            Err(e) => {
                                // Unreadable data counts as corrupt; the
                                // piece will be fetched again.
                                error!(piece_index, error = %e, "Failed to hash piece");
                                false
                            }
                        };
                        debug!(piece_index, valid, "Verified piece");
                        let event = Event::PieceVerified { piece_index, valid };
                        if self.event_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    DiskCommand::Flush => {
                        for file in &files {
                            if let Err(e) = file.sync_all() {
                                error!(error = %e, "Failed to sync file");
                            }
                        }
                    }
                    DiskCommand::QueryStats(response_tx) => {
                        if let Err(e) = response_tx.send(self.stats.clone()).await {
                            error!(error = %e, "Failed to send stats response");
                        }
                    }
                    DiskCommand::Shutdown => {
                        debug!(task = "Disk", "Shutting down");
                        break;
                    }
                }
            }

            for file in &files {
                if let Err(e) = file.sync_all() {
                    error!(error = %e, "Failed to sync file");
                }
            }
        });

        (command_tx, handle)
    }

    /// Opens every file of the layout, creating directories as needed and
    /// preallocating fresh files to their final size.
    fn open_files(&self) -> Result<Vec<File>, DiskError> {
        let mut files = Vec::with_capacity(self.spans.len());
        for span in &self.spans {
            if let Some(parent) = span.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&span.path)?;
            if file.metadata()?.len() == 0 {
                file.set_len(span.length)?;
            }
            files.push(file);
        }
        Ok(files)
    }

    fn block_offset(&self, piece_index: u32, begin: u32) -> u64 {
        piece_index as u64 * self.piece_length + begin as u64
    }

    fn write_at(&self, files: &mut [File], offset: u64, data: &[u8]) -> Result<(), DiskError> {
        let end = offset + data.len() as u64;
        if end > self.total_length {
            return Err(DiskError::OutOfBounds {
                offset,
                length: data.len(),
            });
        }

        let mut remaining = data;
        let mut pos = offset;
        for (span, file) in self.spans.iter().zip(files.iter_mut()) {
            if remaining.is_empty() {
                break;
            }
            let span_end = span.offset + span.length;
            if pos >= span_end {
                continue;
            }
            let within = pos - span.offset;
            let take = ((span.length - within) as usize).min(remaining.len());
            file.seek(SeekFrom::Start(within))?;
            file.write_all(&remaining[..take])?;
            remaining = &remaining[take..];
            pos += take as u64;
        }

        Ok(())
    }

    fn read_at(&self, files: &mut [File], offset: u64, buf: &mut [u8]) -> Result<(), DiskError> {
        let end = offset + buf.len() as u64;
        if end > self.total_length {
            return Err(DiskError::OutOfBounds {
                offset,
                length: buf.len(),
            });
        }

        let mut filled = 0usize;
        let mut pos = offset;
        for (span, file) in self.spans.iter().zip(files.iter_mut()) {
            if filled == buf.len() {
                break;
            }
            let span_end = span.offset + span.length;
            if pos >= span_end {
                continue;
            }
            let within = pos - span.offset;
            let take = ((span.length - within) as usize).min(buf.len() - filled);
            file.seek(SeekFrom::Start(within))?;
            file.read_exact(&mut buf[filled..filled + take])?;
            filled += take;
            pos += take as u64;
        }

        Ok(())
    }

    fn hash_piece(
        &self,
        files: &mut [File],
        piece_index: u32,
        length: u32,
    ) -> Result<[u8; 20], DiskError> {
        let offset = self.block_offset(piece_index, 0);
        let mut buf = vec![0u8; length as usize];
        self.read_at(files, offset, &mut buf)?;
        Ok(Sha1::digest(&buf).into())
    }
}

#[derive(Debug)]
pub enum DiskError {
    Io(io::Error),
    OutOfBounds { offset: u64, length: usize },
}

impl From<io::Error> for DiskError {
    fn from(err: io::Error) -> Self {
        DiskError::Io(err)
    }
}

impl Display for DiskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskError::Io(err) => write!(f, "I/O error: {}", err),
            DiskError::OutOfBounds { offset, length } => write!(
                f,
                "Range at offset {} with length {} falls outside the torrent",
                offset, length
            ),
        }
    }
}

impl Error for DiskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DiskError::Io(err) => Some(err),
            DiskError::OutOfBounds { .. } => None,
        }
    }
}
