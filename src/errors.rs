#[derive(onlyerror::Error, Debug)]
pub enum Error {
    /// A memory range was constructed with its end before its start.
    #[error("inverted memory range {begin}..{end}")]
    InvertedRange { begin: usize, end: usize },
    /// Computing the end of a range overflowed the address space.
    #[error("address overflow computing {base} + {len}")]
    AddressOverflow { base: usize, len: usize },
    /// A write or patch would run past the end of the mapping.
    #[error("write of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    /// The code memory was already published and can no longer be written to.
    #[error("code memory is already published")]
    AlreadyPublished,
    /// The code memory must be published before it can be patched.
    #[error("code memory is not published yet")]
    NotPublished,
    /// A virtual memory syscall failed.
    #[error("virtual memory operation failed: {0}")]
    Mmap(rustix::io::Errno),
}

impl From<rustix::io::Errno> for Error {
    fn from(value: rustix::io::Errno) -> Self {
        Self::Mmap(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn display() {
        let err = Error::InvertedRange {
            begin: 0x2000,
            end: 0x1000,
        };
        assert_eq!(err.to_string(), "inverted memory range 8192..4096");

        let err = Error::OutOfBounds {
            offset: 8,
            len: 16,
            capacity: 16,
        };
        assert_eq!(
            err.to_string(),
            "write of 16 bytes at offset 8 exceeds capacity 16"
        );
    }
}
