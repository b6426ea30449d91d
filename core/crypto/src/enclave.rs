//! Hardened in-memory custody of secrets.
//!
//! Key material is kept in buffers that are pinned with `mlock` where the
//! platform allows it and are always zeroized on drop. An [`Enclave`] is the
//! long-lived home of a secret; [`Enclave::open`] yields a short-lived
//! [`LockedBuffer`] copy that the caller must let go of as soon as the
//! operation using it completes.

use std::fmt;

use zeroize::Zeroize;

#[cfg(unix)]
fn pin_region(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }

    // mlock can fail under RLIMIT_MEMLOCK; custody then degrades to
    // zero-on-drop only.
    unsafe { libc::mlock(data.as_ptr() as *const libc::c_void, data.len()) == 0 }
}

#[cfg(unix)]
fn unpin_region(data: &[u8]) {
    if !data.is_empty() {
        unsafe {
            libc::munlock(data.as_ptr() as *const libc::c_void, data.len());
        }
    }
}

#[cfg(not(unix))]
fn pin_region(_data: &[u8]) -> bool {
    false
}

#[cfg(not(unix))]
fn unpin_region(_data: &[u8]) {}

/// A byte buffer that is pinned in memory and zeroized on drop.
///
/// # Postconditions
/// - The contents are wiped on every exit path, including panics
/// - The backing pages are excluded from swap while the buffer lives,
///   provided the platform honored the lock request
pub struct LockedBuffer {
    data: Box<[u8]>,
    pinned: bool,
}

impl LockedBuffer {
    /// Take ownership of `data` and pin it.
    pub fn new(data: Vec<u8>) -> Self {
        let data = data.into_boxed_slice();
        let pinned = pin_region(&data);
        Self { data, pinned }
    }

    /// Get the protected bytes.
    ///
    /// # Security
    /// The returned slice must be used immediately and never copied into
    /// unprotected storage.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the buffer length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Drop for LockedBuffer {
    fn drop(&mut self) {
        self.data.zeroize();
        if self.pinned {
            unpin_region(&self.data);
        }
    }
}

impl fmt::Debug for LockedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockedBuffer([REDACTED; {} bytes])", self.data.len())
    }
}

/// Long-lived custody of a secret.
///
/// The enclave keeps its own locked copy of the secret for its whole
/// lifetime. Callers never touch that copy directly; they [`open`](Self::open)
/// the enclave to receive a fresh [`LockedBuffer`] scoped to one operation.
pub struct Enclave {
    inner: LockedBuffer,
}

impl Enclave {
    /// Seal `secret` into a new enclave, consuming the source bytes.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            inner: LockedBuffer::new(secret),
        }
    }

    /// Produce a one-shot plaintext copy.
    ///
    /// # Postconditions
    /// - The returned buffer is independently pinned and zeroized on drop
    pub fn open(&self) -> LockedBuffer {
        LockedBuffer::new(self.inner.bytes().to_vec())
    }

    /// Length of the protected secret.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Check if the protected secret is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for Enclave {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Enclave([REDACTED; {} bytes])", self.inner.len())
    }
}
