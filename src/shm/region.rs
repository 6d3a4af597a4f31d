//! Named shared memory regions
//!
//! A `SharedRegion` is a POSIX shm object mapped `MAP_SHARED` into this
//! process. Regions are created by one process and opened by name from all
//! others. A region can grow (never shrink); growing extends the backing
//! object first, so other processes can later remap to the new size, and
//! then remaps the local view. The local mapping may move, but bytes
//! `0..old_len` keep their contents.

use crate::common::{Error, Result};
use crate::shm::names::RegionName;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

pub struct SharedRegion {
    name: RegionName,
    file: File,
    ptr: NonNull<u8>,
    len: usize,
}

fn region_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP
}

impl SharedRegion {
    /// Create a zero-filled region of exactly `size` bytes and map it.
    ///
    /// A leftover object with the same name is truncated to zero first, so
    /// stale contents from an earlier run never survive.
    pub fn allocate(name: RegionName, size: usize) -> Result<Self> {
        let fd = shm_open(name.as_str(), OFlag::O_CREAT | OFlag::O_RDWR, region_mode())
            .map_err(|e| Error::resource("shm_open", name.as_str(), e.into()))?;
        let file = File::from(fd);
        file.set_len(0)
            .and_then(|_| file.set_len(size as u64))
            .map_err(|e| Error::resource("ftruncate", name.as_str(), e))?;
        let ptr = map_file(&file, size).map_err(|e| Error::resource("mmap", name.as_str(), e.into()))?;

        tracing::debug!("Allocated region {} ({} bytes)", name, size);
        Ok(Self {
            name,
            file,
            ptr,
            len: size,
        })
    }

    /// Map `size` bytes of an existing region.
    pub fn open(name: RegionName, size: usize) -> Result<Self> {
        let fd = shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| Error::resource("shm_open", name.as_str(), e.into()))?;
        let file = File::from(fd);
        let backing = file
            .metadata()
            .map_err(|e| Error::resource("fstat", name.as_str(), e))?
            .len();
        if backing < size as u64 {
            return Err(Error::resource(
                "open",
                name.as_str(),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("region holds {} bytes, expected {}", backing, size),
                ),
            ));
        }
        let ptr = map_file(&file, size).map_err(|e| Error::resource("mmap", name.as_str(), e.into()))?;

        tracing::debug!("Opened region {} ({} bytes)", name, size);
        Ok(Self {
            name,
            file,
            ptr,
            len: size,
        })
    }

    /// Grow the region to `new_size` bytes.
    ///
    /// The backing object is extended if no other process has done so yet.
    /// Growing to the current size is a no-op; shrinking is an error.
    pub fn grow(&mut self, new_size: usize) -> Result<()> {
        if new_size < self.len {
            return Err(Error::resource(
                "grow",
                self.name.as_str(),
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot shrink from {} to {} bytes", self.len, new_size),
                ),
            ));
        }
        if new_size == self.len {
            return Ok(());
        }

        let backing = self
            .file
            .metadata()
            .map_err(|e| Error::resource("fstat", self.name.as_str(), e))?
            .len();
        if backing < new_size as u64 {
            self.file
                .set_len(new_size as u64)
                .map_err(|e| Error::resource("ftruncate", self.name.as_str(), e))?;
        }

        // Safety: ptr/len describe our current mapping of this file
        self.ptr = unsafe { remap_file(&self.file, self.ptr, self.len, new_size) }
            .map_err(|e| Error::resource("mremap", self.name.as_str(), e.into()))?;
        tracing::debug!(
            "Grew region {} from {} to {} bytes",
            self.name,
            self.len,
            new_size
        );
        self.len = new_size;
        Ok(())
    }

    /// Unmap the region and remove its name for good.
    pub fn destroy(self) -> Result<()> {
        let name = self.name.clone();
        drop(self);
        Self::unlink(&name)
    }

    /// Remove a region name without mapping it.
    pub fn unlink(name: &RegionName) -> Result<()> {
        shm_unlink(name.as_str()).map_err(|e| Error::resource("shm_unlink", name.as_str(), e.into()))?;
        tracing::debug!("Unlinked region {}", name);
        Ok(())
    }

    pub fn name(&self) -> &RegionName {
        &self.name
    }

    /// Size of the local mapping in bytes.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    fn as_slice(&self) -> &[u8] {
        // Safety: the mapping is valid for len bytes while self lives
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[cfg(test)]
    fn as_slice_mut(&mut self) -> &mut [u8] {
        // Safety: the mapping is valid for len bytes while self lives
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Base address of the local mapping. Only valid until the next `grow`.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

fn map_file(file: &File, size: usize) -> nix::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size).ok_or(Errno::EINVAL)?;
    // Safety: fresh mapping, no existing memory is affected
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )?
    };
    Ok(ptr.cast())
}

#[cfg(target_os = "linux")]
unsafe fn remap_file(
    _file: &File,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
) -> nix::Result<NonNull<u8>> {
    use nix::sys::mman::{mremap, MRemapFlags};
    let ptr = mremap(
        ptr.cast(),
        old_size,
        new_size,
        MRemapFlags::MREMAP_MAYMOVE,
        None,
    )?;
    Ok(ptr.cast())
}

#[cfg(not(target_os = "linux"))]
unsafe fn remap_file(
    file: &File,
    ptr: NonNull<u8>,
    old_size: usize,
    new_size: usize,
) -> nix::Result<NonNull<u8>> {
    let new_ptr = map_file(file, new_size)?;
    munmap(ptr.cast(), old_size)?;
    Ok(new_ptr)
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // Safety: ptr/len describe a live mapping owned by this region
        unsafe {
            _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

// The mapping is process-wide; nothing ties it to the creating thread.
unsafe impl Send for SharedRegion {}
