use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{DimRedError, Result};

pub trait ZeroVec {
    fn zero_len(&mut self, len: usize);
}

impl<T: Default + Clone> ZeroVec for Vec<T> {
    fn zero_len(&mut self, len: usize) {
        self.clear();
        self.reserve(len);
        self.extend(std::iter::repeat_n(T::default(), len));
    }
}

/// Trait for types that can be used as row group labels
pub trait GroupIdentifier: Clone + Eq + Hash {}

// Implement GroupIdentifier for common types
impl GroupIdentifier for String {}
impl GroupIdentifier for &str {}
impl GroupIdentifier for i32 {}
impl GroupIdentifier for u32 {}
impl GroupIdentifier for usize {}

/// Shared flag checked by the iterative optimizers between epochs.
///
/// Clones observe the same flag, so a UI thread can keep one copy and hand
/// another to a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DimRedError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_len_reuses_buffer() {
        let mut buf = vec![1.0_f64, 2.0, 3.0];
        buf.zero_len(5);
        assert_eq!(buf, vec![0.0; 5]);

        buf.zero_len(2);
        assert_eq!(buf, vec![0.0; 2]);
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());

        other.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(DimRedError::Cancelled));
    }
}
