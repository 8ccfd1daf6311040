//! Buffered binary file stream with independent read ("get") and write ("put")
//! cursors, built on positional I/O.
//!
//! The stream tracks its own logical size: seeking the put cursor past the end
//! of the written region does not grow the stream until a write actually lands
//! bytes there, and rewriting inside the written region never grows it. This
//! matches the semantics that container writers rely on when they seek back to
//! patch a header after the body has been written.

#![forbid(unused_must_use)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fs::File;
use std::io::{self, SeekFrom};
use std::mem::size_of;
use std::path::Path;
use sync_file::{RandomAccessFile, ReadAt, WriteAt};
use zerocopy::{FromBytes, Immutable, IntoBytes};

/// Length of the reusable zero buffer used by [`BinaryIo::pad`].
const ZERO_CHUNK_LEN: usize = 4096;

/// A binary stream over a positional file.
///
/// The get and put cursors move independently, like the get/put pointers of a
/// C++ iostream. All transfers go through [`ReadAt`]/[`WriteAt`], so a single
/// underlying file handle never has cursor state of its own.
pub struct BinaryIo<F = RandomAccessFile> {
    file: F,
    get_pos: u64,
    put_pos: u64,
    size: u64,
    zeroes: Box<[u8]>,
}

impl BinaryIo<RandomAccessFile> {
    /// Opens an existing file for read access.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::with_file(RandomAccessFile::from(file), size))
    }

    /// Creates a new file (**truncating any existing file**) for write access.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::with_file(RandomAccessFile::from(file), 0))
    }

    /// Opens an existing file for read/write access.
    pub fn modify(path: &Path) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::with_file(RandomAccessFile::from(file), size))
    }
}

impl<F> BinaryIo<F> {
    /// Wraps an already-opened file. `size` is the current logical size of the
    /// stream, in bytes.
    pub fn with_file(file: F, size: u64) -> Self {
        Self {
            file,
            get_pos: 0,
            put_pos: 0,
            size,
            zeroes: vec![0u8; ZERO_CHUNK_LEN].into_boxed_slice(),
        }
    }

    /// Returns the logical size of the stream. This counts only bytes that
    /// have actually been written (or that existed when the file was opened),
    /// not put-cursor positions reached by seeking.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The current position of the get cursor.
    pub fn tell_get(&self) -> u64 {
        self.get_pos
    }

    /// The current position of the put cursor.
    pub fn tell_put(&self) -> u64 {
        self.put_pos
    }

    /// Moves the get cursor.
    pub fn seek_get(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.get_pos = self.resolve_seek(pos, self.get_pos)?;
        Ok(self.get_pos)
    }

    /// Moves the put cursor. Seeking past the end of the stream is allowed;
    /// the stream does not grow until a later write lands bytes there.
    pub fn seek_put(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.put_pos = self.resolve_seek(pos, self.put_pos)?;
        Ok(self.put_pos)
    }

    fn resolve_seek(&self, pos: SeekFrom, current: u64) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => current.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size.checked_add_signed(delta),
        };
        target.ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))
    }

    /// Extracts the underlying file.
    pub fn into_inner(self) -> F {
        self.file
    }

    /// Gets access to the underlying file.
    pub fn file(&self) -> &F {
        &self.file
    }
}

impl<F: ReadAt> BinaryIo<F> {
    /// Reads exactly `buf.len()` bytes at the get cursor and advances it.
    pub fn read_into(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, self.get_pos)?;
        self.get_pos += buf.len() as u64;
        Ok(())
    }

    /// Reads one fixed-size value at the get cursor and advances it.
    pub fn read<T: FromBytes + IntoBytes>(&mut self) -> io::Result<T> {
        let mut value = T::new_zeroed();
        self.file.read_exact_at(value.as_mut_bytes(), self.get_pos)?;
        self.get_pos += size_of::<T>() as u64;
        Ok(value)
    }

    /// Reads a NUL-terminated string at the get cursor, leaving the cursor
    /// just past the terminator. The terminator is not part of the result.
    pub fn read_cstr(&mut self) -> io::Result<String> {
        let mut out: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            let n = self.file.read_at(&mut chunk, self.get_pos + out.len() as u64)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            if let Some(nul) = chunk[..n].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                self.get_pos += out.len() as u64 + 1;
                return String::from_utf8(out)
                    .map_err(|_| io::Error::from(io::ErrorKind::InvalidData));
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

impl<F: WriteAt> BinaryIo<F> {
    /// Writes raw bytes at the put cursor and advances it, growing the
    /// logical size if the write extends past the previous end.
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all_at(data, self.put_pos)?;
        self.put_pos += data.len() as u64;
        self.size = self.size.max(self.put_pos);
        Ok(())
    }

    /// Writes one fixed-size value (or slice of them) at the put cursor.
    pub fn write<T: IntoBytes + Immutable + ?Sized>(&mut self, value: &T) -> io::Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Writes the string bytes followed by a NUL terminator.
    pub fn write_cstr(&mut self, value: &str) -> io::Result<()> {
        self.write_bytes(value.as_bytes())?;
        self.write_bytes(&[0u8])
    }

    /// Writes `count` zero bytes at the put cursor, reusing an internal zero
    /// buffer.
    pub fn pad(&mut self, count: u64) -> io::Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            let n = remaining.min(ZERO_CHUNK_LEN as u64) as usize;
            let zeroes = std::mem::take(&mut self.zeroes);
            let result = self.write_bytes(&zeroes[..n]);
            self.zeroes = zeroes;
            result?;
            remaining -= n as u64;
        }
        Ok(())
    }
}
