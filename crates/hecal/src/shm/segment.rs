// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory mappings.
//!
//! Safe wrappers around `shm_open`, `ftruncate` and `mmap` used by the
//! channel files, the named events and the named mutexes. Logical names
//! carry no `/` prefix (they match the file name under `/dev/shm`); the
//! POSIX form is derived internally.
//!
//! # Lifecycle
//!
//! 1. The owning side creates a segment with [`ShmSegment::create`]
//! 2. Peers map it with [`ShmSegment::open`] (size taken from the file)
//! 3. Mappings are released on drop
//! 4. The owner calls [`ShmSegment::unlink`] on cleanup
//!
//! A grown segment ([`ShmSegment::grow`]) keeps its name; peers detect the
//! larger file and re-open.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// One memory-mapped named region.
///
/// Unmaps on drop; never unlinks implicitly.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is shared memory accessed from multiple threads and
// processes; all concurrent access goes through atomic fields or is guarded
// by the channel's named mutex.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

fn posix_name(name: &str) -> Result<CString> {
    validate_name(name)?;
    CString::new(format!("/{name}")).map_err(|_| ShmError::InvalidName(name.to_string()))
}

/// Logical segment names: non-empty ASCII, no separators, bounded length.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 250 {
        return Err(ShmError::InvalidName(format!(
            "segment name length out of range: {name:?}"
        )));
    }
    if !name.bytes().all(|b| b.is_ascii_graphic()) || name.contains('/') {
        return Err(ShmError::InvalidName(format!(
            "segment name must be plain ASCII without '/': {name:?}"
        )));
    }
    Ok(())
}

impl ShmSegment {
    /// Create a segment of exactly `size` bytes, replacing any stale file
    /// with the same name. The region is zero-initialized.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = posix_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string. Unlinking first
        // reclaims stale files from crashed owners (errors ignored);
        // O_CREAT|O_EXCL then guarantees we own a fresh file.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor obtained above; ftruncate sets
        // the file length, failing gracefully for absurd sizes.
        let rc = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used after this error path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = map_fd(fd, size)?;

        // SAFETY: ptr maps exactly `size` writable bytes and no other
        // reference exists yet (the file was just created).
        unsafe { ptr::write_bytes(ptr, 0, size) };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map an existing segment; the mapping covers the file's current size.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = posix_name(name)?;

        // SAFETY: c_name is a valid NUL-terminated string; O_RDWR opens the
        // existing object without creating.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let size = match file_size(fd) {
            Ok(s) => s,
            Err(e) => {
                // SAFETY: fd is valid and unused after this error path.
                unsafe { libc::close(fd) };
                return Err(e);
            }
        };
        if size == 0 {
            // SAFETY: fd is valid and unused after this error path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentOpen(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "zero-length segment",
            )));
        }

        let ptr = map_fd(fd, size)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Enlarge this segment in place and remap it.
    ///
    /// Shrinking is refused. Peers holding the old (smaller) mapping keep a
    /// valid view of the leading bytes and re-open once they notice.
    pub fn grow(&mut self, new_size: usize) -> Result<()> {
        if new_size <= self.size {
            return Ok(());
        }
        let c_name = posix_name(&self.name)?;
        // SAFETY: c_name is valid; the file still exists because we hold a
        // mapping of it.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::SegmentOpen(io::Error::last_os_error()));
        }
        // SAFETY: fd is valid; growing via ftruncate zero-fills the tail.
        let rc = unsafe { libc::ftruncate(fd, new_size as libc::off_t) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd valid, error path.
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentCreate(err));
        }
        let new_ptr = map_fd(fd, new_size)?;
        // SAFETY: the old mapping came from mmap with exactly self.size
        // bytes and is unmapped exactly once here.
        unsafe { libc::munmap(self.ptr.cast::<libc::c_void>(), self.size) };
        self.ptr = new_ptr;
        self.size = new_size;
        Ok(())
    }

    /// Remove the named file. Idempotent: a missing file is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = posix_name(name)?;
        // SAFETY: c_name is valid; shm_unlink only touches the namespace.
        let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// Whether a segment with this name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = posix_name(name) else {
            return false;
        };
        // SAFETY: c_name is valid; read-only probe.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd valid, closed exactly once.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Base pointer of the mapping.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Mapped size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Logical name (no `/` prefix).
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from a successful mmap and Drop runs once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
    }
}

/// mmap a descriptor read-write shared; closes the fd in every outcome.
fn map_fd(fd: libc::c_int, size: usize) -> Result<*mut u8> {
    // SAFETY: kernel-chosen address, valid fd, standard RW shared mapping
    // from offset 0; MAP_FAILED checked below. The fd may be closed after
    // mmap, the mapping keeps its own reference.
    let ptr = unsafe {
        let p = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        libc::close(fd);
        p
    };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Mmap(io::Error::last_os_error()));
    }
    Ok(ptr.cast::<u8>())
}

fn file_size(fd: libc::c_int) -> Result<usize> {
    // SAFETY: stat is zero-initializable POD; fstat fills it for a valid fd.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: fd is valid, stat points to a properly sized buffer.
    let rc = unsafe { libc::fstat(fd, &mut stat) };
    if rc < 0 {
        return Err(ShmError::SegmentOpen(io::Error::last_os_error()));
    }
    Ok(stat.st_size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("hecal_test_{tag}_{}_{}", std::process::id(), fastrand::u32(..))
    }

    #[test]
    fn validate_name_rules() {
        assert!(validate_name("ecal_host_1_ab_0").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("with/slash").is_err());
        assert!(validate_name("with space").is_err());
    }

    #[test]
    fn create_open_share_bytes() {
        let name = unique_name("share");
        let seg1 = ShmSegment::create(&name, 4096).expect("create");
        assert_eq!(seg1.size(), 4096);

        // SAFETY: offsets 0/1 are inside the 4096-byte mapping just created.
        unsafe {
            *seg1.as_ptr() = 0xAB;
            *seg1.as_ptr().add(1) = 0xCD;
        }

        let seg2 = ShmSegment::open(&name).expect("open");
        assert_eq!(seg2.size(), 4096);
        // SAFETY: same segment, same bounds; bytes written above.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0xAB);
            assert_eq!(*seg2.as_ptr().add(1), 0xCD);
        }

        drop(seg1);
        drop(seg2);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn create_zero_initializes() {
        let name = unique_name("zero");
        let seg = ShmSegment::create(&name, 128).expect("create");
        // SAFETY: 128 bytes valid, freshly created and zeroed.
        let all_zero = unsafe { (0..128).all(|i| *seg.as_ptr().add(i) == 0) };
        assert!(all_zero);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn open_missing_is_not_found() {
        let result = ShmSegment::open("hecal_test_definitely_missing_42");
        assert!(matches!(result, Err(ShmError::NotFound(_))));
    }

    #[test]
    fn grow_preserves_content() {
        let name = unique_name("grow");
        let mut seg = ShmSegment::create(&name, 256).expect("create");
        // SAFETY: offset 10 is inside the 256-byte mapping.
        unsafe { *seg.as_ptr().add(10) = 0x42 };

        seg.grow(1024).expect("grow");
        assert_eq!(seg.size(), 1024);
        // SAFETY: offset 10 inside the new 1024-byte mapping; content is
        // preserved by ftruncate growth.
        unsafe { assert_eq!(*seg.as_ptr().add(10), 0x42) };

        // Peers opening now see the full size.
        let peer = ShmSegment::open(&name).expect("open");
        assert_eq!(peer.size(), 1024);

        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name("unlink");
        let _seg = ShmSegment::create(&name, 64).expect("create");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }

    #[test]
    fn exists_tracks_lifecycle() {
        let name = unique_name("exists");
        assert!(!ShmSegment::exists(&name));
        let _seg = ShmSegment::create(&name, 64).expect("create");
        assert!(ShmSegment::exists(&name));
        ShmSegment::unlink(&name).ok();
        assert!(!ShmSegment::exists(&name));
    }
}
