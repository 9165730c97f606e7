//! Memory bridge between host byte streams and guest linear memory.
//!
//! Data crosses the boundary in three steps: size the input on the host,
//! allocate a region with the guest's own `malloc`, copy the bytes in. The
//! guest copies anything it keeps, so a [`GuestRegion`] is freed right after
//! the call that consumes it.
//!
//! Ownership is enforced by the type: a region is neither `Clone` nor
//! `Copy`, and [`free`] consumes it, so a region can be freed at most once.
//! Helpers that allocate on the caller's behalf ([`marshal`],
//! [`marshal_str`]) free the region themselves when the copy fails.
//!
//! Strings returned by the guest are read with [`read_c_string`] and
//! released with [`read_and_free`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use tracing::warn;

use crate::Sandbox;
use tessera_common::RuntimeError;

/// A readable, seekable stream.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// A byte stream headed for guest memory.
pub enum InputSource {
    /// In-memory bytes; the length is known up front.
    Bytes(Bytes),
    /// A stream whose length is found by seeking to its end.
    Seekable(Box<dyn ReadSeek>),
    /// A stream of unknown length; buffered fully when sized.
    Reader(Box<dyn Read + Send>),
}

impl InputSource {
    /// Wrap a seekable stream.
    pub fn seekable(stream: impl Read + Seek + Send + 'static) -> Self {
        InputSource::Seekable(Box::new(stream))
    }

    /// Wrap a stream of unknown length.
    pub fn reader(stream: impl Read + Send + 'static) -> Self {
        InputSource::Reader(Box::new(stream))
    }
}

impl From<Bytes> for InputSource {
    fn from(bytes: Bytes) -> Self {
        InputSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for InputSource {
    fn from(bytes: Vec<u8>) -> Self {
        InputSource::Bytes(bytes.into())
    }
}

impl From<&'static [u8]> for InputSource {
    fn from(bytes: &'static [u8]) -> Self {
        InputSource::Bytes(Bytes::from_static(bytes))
    }
}

impl From<File> for InputSource {
    fn from(file: File) -> Self {
        InputSource::seekable(file)
    }
}

impl std::fmt::Debug for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputSource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            InputSource::Seekable(_) => f.write_str("Seekable"),
            InputSource::Reader(_) => f.write_str("Reader"),
        }
    }
}

/// A span of guest memory allocated by the host.
#[derive(Debug)]
#[must_use = "a guest region must be passed to `memory::free`"]
pub struct GuestRegion {
    ptr: u32,
    len: u32,
    nul_terminated: bool,
}

impl GuestRegion {
    /// Guest address of the first byte.
    pub fn ptr(&self) -> u32 {
        self.ptr
    }

    /// Payload length, excluding the terminator.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_nul_terminated(&self) -> bool {
        self.nul_terminated
    }

    /// Address as passed to guest calls.
    pub fn ptr_arg(&self) -> i32 {
        self.ptr as i32
    }

    /// Length as passed to guest calls.
    pub fn len_arg(&self) -> i32 {
        self.len as i32
    }
}

/// Number of bytes `input` will occupy in guest memory.
///
/// A [`InputSource::Reader`] is read to the end and replaced by the
/// buffered bytes. A [`InputSource::Seekable`] is left positioned at its
/// start.
///
/// # Errors
///
/// - `EmptyInput` for a zero-length input
/// - `Overflow` if the input does not fit a 32-bit address space
/// - `Io` if reading or seeking fails
pub fn size_of(input: &mut InputSource) -> Result<u32, RuntimeError> {
    let size = match input {
        InputSource::Bytes(bytes) => bytes.len() as u64,
        InputSource::Seekable(stream) => {
            let end = stream.seek(SeekFrom::End(0))?;
            stream.seek(SeekFrom::Start(0))?;
            end
        }
        InputSource::Reader(reader) => {
            let mut buffer = Vec::new();
            reader.read_to_end(&mut buffer)?;
            let len = buffer.len() as u64;
            *input = InputSource::Bytes(buffer.into());
            len
        }
    };

    if size == 0 {
        return Err(RuntimeError::EmptyInput);
    }
    u32::try_from(size).map_err(|_| RuntimeError::Overflow { size })
}

/// Allocate `size` bytes of guest memory, plus a terminator if requested.
///
/// # Errors
///
/// - `Overflow` if `size` plus the terminator wraps
/// - `AllocationFailed` if the guest returns null or a span outside its
///   memory
/// - `Unrecoverable` or `Trap` if the sandbox is closed or traps
pub async fn allocate(
    sandbox: &mut Sandbox,
    size: u32,
    nul_terminated: bool,
) -> Result<GuestRegion, RuntimeError> {
    let total = size
        .checked_add(u32::from(nul_terminated))
        .ok_or(RuntimeError::Overflow {
            size: u64::from(size) + 1,
        })?;

    let ptr = sandbox.call("malloc", |e| &e.malloc, total as i32).await? as u32;
    if ptr == 0 {
        return Err(RuntimeError::AllocationFailed {
            size: u64::from(total),
        });
    }

    let end = u64::from(ptr) + u64::from(total);
    if end > sandbox.memory().len() as u64 {
        warn!(ptr, size = total, "Guest allocator returned an out-of-bounds region");
        return Err(RuntimeError::AllocationFailed {
            size: u64::from(total),
        });
    }

    Ok(GuestRegion {
        ptr,
        len: size,
        nul_terminated,
    })
}

/// Copy exactly `region.len()` bytes of `input` into the region.
///
/// Writes the terminator when the region has one. The caller still owns the
/// region and frees it on error.
///
/// # Errors
///
/// - `Marshal` if the input ends before the region is full
/// - `Unrecoverable` if the sandbox is closed
/// - `Io` if reading fails
pub fn write(
    sandbox: &mut Sandbox,
    region: &GuestRegion,
    input: &mut InputSource,
) -> Result<(), RuntimeError> {
    if sandbox.is_closed() {
        return Err(RuntimeError::unrecoverable(
            "write into a closed sandbox",
        ));
    }

    let start = region.ptr as usize;
    let len = region.len as usize;
    let memory = sandbox.memory_mut();
    let dest = &mut memory[start..start + len];

    let written = match input {
        InputSource::Bytes(bytes) => {
            let n = bytes.len().min(len);
            dest[..n].copy_from_slice(&bytes[..n]);
            n
        }
        InputSource::Seekable(stream) => fill(stream.as_mut(), dest)?,
        InputSource::Reader(reader) => fill(reader.as_mut(), dest)?,
    };

    if written < len {
        return Err(RuntimeError::Marshal {
            written: written as u64,
            expected: len as u64,
        });
    }

    if region.nul_terminated {
        memory[start + len] = 0;
    }

    Ok(())
}

fn fill(reader: &mut (impl Read + ?Sized), dest: &mut [u8]) -> Result<usize, RuntimeError> {
    let mut written = 0;
    while written < dest.len() {
        match reader.read(&mut dest[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(written)
}

/// Size, allocate and fill a region with `input`.
///
/// The region is freed here if the copy fails.
pub async fn marshal(
    sandbox: &mut Sandbox,
    input: &mut InputSource,
) -> Result<GuestRegion, RuntimeError> {
    let size = size_of(input)?;
    let region = allocate(sandbox, size, false).await?;
    if let Err(e) = write(sandbox, &region, input) {
        release_after_error(sandbox, region).await;
        return Err(e);
    }
    Ok(region)
}

/// Copy `value` into a fresh NUL-terminated region.
///
/// Empty strings are allowed.
pub async fn marshal_str(sandbox: &mut Sandbox, value: &str) -> Result<GuestRegion, RuntimeError> {
    let size = u32::try_from(value.len()).map_err(|_| RuntimeError::Overflow {
        size: value.len() as u64,
    })?;
    let region = allocate(sandbox, size, true).await?;
    let mut input = InputSource::Bytes(Bytes::copy_from_slice(value.as_bytes()));
    if let Err(e) = write(sandbox, &region, &mut input) {
        release_after_error(sandbox, region).await;
        return Err(e);
    }
    Ok(region)
}

async fn release_after_error(sandbox: &mut Sandbox, region: GuestRegion) {
    let ptr = region.ptr;
    if let Err(e) = free(sandbox, region).await {
        warn!(ptr, error = %e, "Failed to release guest region after a failed copy");
    }
}

/// Read the NUL-terminated string at `ptr`.
///
/// Returns an empty string when `ptr` is null or out of bounds, or when no
/// terminator occurs before the end of memory. Invalid UTF-8 is replaced.
pub fn read_c_string(sandbox: &Sandbox, ptr: u32) -> String {
    let memory = sandbox.memory();
    let start = ptr as usize;
    if ptr == 0 || start >= memory.len() {
        return String::new();
    }

    match memory[start..].iter().position(|&b| b == 0) {
        Some(end) => String::from_utf8_lossy(&memory[start..start + end]).into_owned(),
        None => String::new(),
    }
}

/// Read the guest-allocated string at `ptr`, then free it.
///
/// A null `ptr` yields an empty string and frees nothing.
pub async fn read_and_free(sandbox: &mut Sandbox, ptr: u32) -> Result<String, RuntimeError> {
    if ptr == 0 {
        return Ok(String::new());
    }

    let value = read_c_string(sandbox, ptr);
    free_ptr(sandbox, ptr).await?;
    Ok(value)
}

/// Return a region to the guest allocator.
///
/// A no-op once the sandbox is closed: its memory goes away with it.
pub async fn free(sandbox: &mut Sandbox, region: GuestRegion) -> Result<(), RuntimeError> {
    free_ptr(sandbox, region.ptr).await
}

async fn free_ptr(sandbox: &mut Sandbox, ptr: u32) -> Result<(), RuntimeError> {
    if sandbox.is_closed() {
        return Ok(());
    }
    sandbox.call("free", |e| &e.free, ptr as i32).await
}
