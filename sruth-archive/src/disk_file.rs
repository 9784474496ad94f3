use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use sruth_core::{from_cbor, to_cbor, ArchiveTime, FiniteBitSet, FileInfo, Piece, PieceSpec};
use tracing::{debug, trace, warn};

/// A data-file resident on disk.
///
/// While incomplete it lives under the hidden tree with a serialized piece
/// bitmap appended after position `size`; the piece that sets the last bit
/// truncates the trailer and atomically renames the file into view. All
/// methods serialize on the per-file mutex.
pub(crate) struct DiskFile {
    info: FileInfo,
    hidden_path: PathBuf,
    visible_path: PathBuf,
    state: Mutex<State>,
}

struct State {
    file: Option<File>,
    bits: FiniteBitSet,
    complete: bool,
}

impl DiskFile {
    /// Opens (or creates) the on-disk file for `info`. A visible file is
    /// opened read-only as complete; otherwise the hidden staging copy is
    /// opened read-write, restoring the piece bitmap from its trailer.
    pub fn open(info: FileInfo, hidden_path: PathBuf, visible_path: PathBuf) -> io::Result<Self> {
        let disk_file = Self {
            state: Mutex::new(State {
                file: None,
                bits: FiniteBitSet::empty(info.piece_count()),
                complete: visible_path.exists(),
            }),
            info,
            hidden_path,
            visible_path,
        };
        {
            let mut state = disk_file.state.lock().expect("disk file lock");
            disk_file.ensure_open(&mut state)?;
        }
        Ok(disk_file)
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn time(&self) -> ArchiveTime {
        self.info.time()
    }

    fn ensure_open(&self, state: &mut State) -> io::Result<()> {
        if state.file.is_some() {
            return Ok(());
        }
        if state.complete {
            state.file = Some(File::open(&self.visible_path)?);
            state.bits = FiniteBitSet::complete(self.info.piece_count());
            return Ok(());
        }
        if self.hidden_path.exists() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.hidden_path)?;
            state.bits = self.read_trailer(&mut file)?;
            state.file = Some(file);
        } else {
            if let Some(parent) = self.hidden_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.hidden_path)?;
            state.bits = FiniteBitSet::empty(self.info.piece_count());
            state.file = Some(file);
            self.info.time().apply_to(&self.hidden_path)?;
        }
        Ok(())
    }

    /// Restores the piece bitmap from the bytes past position `size`. A
    /// missing or unreadable trailer restarts the file from an empty bitmap.
    fn read_trailer(&self, file: &mut File) -> io::Result<FiniteBitSet> {
        let len = file.metadata()?.len();
        if len <= self.info.size() {
            if len > 0 {
                warn!(
                    path = %self.hidden_path.display(),
                    "partial file has no piece bitmap; starting over"
                );
            }
            return Ok(FiniteBitSet::empty(self.info.piece_count()));
        }
        file.seek(SeekFrom::Start(self.info.size()))?;
        let mut trailer = Vec::with_capacity((len - self.info.size()) as usize);
        file.read_to_end(&mut trailer)?;
        match from_cbor::<FiniteBitSet>(&trailer) {
            Ok(bits) if bits.count() == self.info.piece_count() => Ok(bits),
            Ok(_) | Err(_) => {
                warn!(
                    path = %self.hidden_path.display(),
                    "unreadable piece bitmap; starting over"
                );
                Ok(FiniteBitSet::empty(self.info.piece_count()))
            }
        }
    }

    pub fn has_piece(&self, index: u32) -> bool {
        if !self.info.valid_index(index) {
            return false;
        }
        let state = self.state.lock().expect("disk file lock");
        state.bits.is_set(index)
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state.lock().expect("disk file lock");
        state.complete
    }

    /// Writes one piece. Returns `(complete, newly_completed)`; completion
    /// closes the file, strips the trailer, and reveals it atomically,
    /// retrying the rename when a parent directory is deleted underneath.
    pub fn put_piece(&self, piece: &Piece) -> io::Result<(bool, bool)> {
        let mut state = self.state.lock().expect("disk file lock");
        if state.bits.is_set(piece.index()) {
            return Ok((state.complete, false));
        }
        self.ensure_open(&mut state)?;
        let file = state.file.as_mut().expect("file is open");
        file.seek(SeekFrom::Start(piece.offset()))?;
        file.write_all(piece.data())?;
        state.bits = std::mem::replace(
            &mut state.bits,
            FiniteBitSet::complete(0),
        )
        .set_bit(piece.index());
        self.info.time().apply_to(&self.hidden_path)?;
        if !state.bits.are_all_set() {
            return Ok((false, false));
        }

        // Last piece: drop the trailer, close, and move into view.
        let file = state.file.take().expect("file is open");
        file.set_len(self.info.size())?;
        drop(file);
        loop {
            if let Some(parent) = self.visible_path.parent() {
                match std::fs::create_dir_all(parent) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        trace!(path = %self.visible_path.display(), "directory in path just deleted");
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            }
            match std::fs::rename(&self.hidden_path, &self.visible_path) {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    trace!(path = %self.visible_path.display(), "directory in path just deleted");
                }
                Err(err) => {
                    let _ = std::fs::remove_file(&self.hidden_path);
                    return Err(err);
                }
            }
        }
        debug!(file = %self.info.id(), "received file");
        state.complete = true;
        Ok((true, true))
    }

    pub fn get_piece(&self, spec: &PieceSpec) -> io::Result<Piece> {
        let mut state = self.state.lock().expect("disk file lock");
        self.ensure_open(&mut state)?;
        let file = state.file.as_mut().expect("file is open");
        file.seek(SeekFrom::Start(spec.info.offset(spec.index)))?;
        let mut data = vec![0u8; spec.info.piece_len(spec.index) as usize];
        file.read_exact(&mut data)?;
        Ok(Piece::new(spec.info.clone(), spec.index, Bytes::from(data)))
    }

    /// Closes the channel, persisting the piece bitmap after position
    /// `size` when the file is still a hidden partial. Reopening restores
    /// the bitmap. Does nothing if already closed.
    pub fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("disk file lock");
        let Some(mut file) = state.file.take() else {
            return Ok(());
        };
        if state.complete {
            return Ok(());
        }
        let trailer = to_cbor(&state.bits)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        file.seek(SeekFrom::Start(self.info.size()))?;
        file.write_all(&trailer)?;
        file.set_len(self.info.size() + trailer.len() as u64)?;
        drop(file);
        self.info.time().apply_to(&self.hidden_path)?;
        Ok(())
    }

    /// Deletes the on-disk file, closing it first if necessary.
    pub fn delete(&self) -> io::Result<()> {
        let mut state = self.state.lock().expect("disk file lock");
        state.file = None;
        let path: &Path = if state.complete {
            &self.visible_path
        } else {
            &self.hidden_path
        };
        std::fs::remove_file(path)
    }
}
