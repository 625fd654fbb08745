//! Build state of a volume's local device chain
//!
//! ```text
//! multipath -> cache -> origin
//!                  \--> exported target
//! ```
//!
//! A resource can only be recorded once the one beneath it exists, and only
//! released once nothing above it remains.

use std::path::{Path, PathBuf};

use vmthunder_common::TargetHandle;

use crate::error::{ThunderError, ThunderResult};

#[derive(Clone, Debug, Default)]
pub struct DeviceChain {
    multipath: Option<PathBuf>,
    cache: Option<PathBuf>,
    origin: Option<PathBuf>,
    target: Option<TargetHandle>,
}

impl DeviceChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn multipath(&self) -> Option<&Path> {
        self.multipath.as_deref()
    }

    pub fn cache(&self) -> Option<&Path> {
        self.cache.as_deref()
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }

    pub fn target(&self) -> Option<&TargetHandle> {
        self.target.as_ref()
    }

    pub fn set_multipath(&mut self, path: PathBuf) {
        self.multipath = Some(path);
    }

    pub fn set_cache(&mut self, path: PathBuf) -> ThunderResult<()> {
        if self.multipath.is_none() {
            return Err(ThunderError::InvalidTransition(
                "cache requires a multipath device".to_string(),
            ));
        }
        self.cache = Some(path);
        Ok(())
    }

    pub fn set_origin(&mut self, path: PathBuf) -> ThunderResult<()> {
        if self.cache.is_none() {
            return Err(ThunderError::InvalidTransition(
                "origin requires a cached device".to_string(),
            ));
        }
        self.origin = Some(path);
        Ok(())
    }

    pub fn set_target(&mut self, target: TargetHandle) -> ThunderResult<()> {
        if self.cache.is_none() {
            return Err(ThunderError::InvalidTransition(
                "target requires a cached device".to_string(),
            ));
        }
        self.target = Some(target);
        Ok(())
    }

    pub fn take_origin(&mut self) -> Option<PathBuf> {
        self.origin.take()
    }

    pub fn take_target(&mut self) -> Option<TargetHandle> {
        self.target.take()
    }

    /// Cache may go once neither the origin nor the target sits on it
    pub fn can_detach_cache(&self) -> bool {
        self.origin.is_none() && self.target.is_none()
    }

    /// Multipath may go once the cache is gone
    pub fn can_remove_multipath(&self) -> bool {
        self.cache.is_none()
    }

    pub fn take_cache(&mut self) -> ThunderResult<Option<PathBuf>> {
        if !self.can_detach_cache() {
            return Err(ThunderError::InvalidTransition(
                "cache still in use by origin or target".to_string(),
            ));
        }
        Ok(self.cache.take())
    }

    pub fn take_multipath(&mut self) -> ThunderResult<Option<PathBuf>> {
        if !self.can_remove_multipath() {
            return Err(ThunderError::InvalidTransition(
                "multipath still in use by cache".to_string(),
            ));
        }
        Ok(self.multipath.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built() -> DeviceChain {
        let mut chain = DeviceChain::new();
        chain.set_multipath(PathBuf::from("/dev/mapper/multipath_vol1"));
        chain
            .set_cache(PathBuf::from("/dev/mapper/cached_multipath_vol1"))
            .unwrap();
        chain
            .set_origin(PathBuf::from("/dev/mapper/origin_vol1"))
            .unwrap();
        chain
            .set_target(TargetHandle {
                tid: 1,
                iqn: "iqn.p".to_string(),
            })
            .unwrap();
        chain
    }

    #[test]
    fn test_build_order_enforced() {
        let mut chain = DeviceChain::new();
        assert!(chain.set_cache(PathBuf::from("/dev/x")).is_err());
        assert!(chain.set_origin(PathBuf::from("/dev/x")).is_err());
        chain.set_multipath(PathBuf::from("/dev/mapper/multipath_vol1"));
        assert!(chain.set_origin(PathBuf::from("/dev/x")).is_err());
        assert!(
            chain
                .set_target(TargetHandle {
                    tid: 1,
                    iqn: "iqn.p".to_string()
                })
                .is_err()
        );
    }

    #[test]
    fn test_release_order_enforced() {
        let mut chain = built();
        assert!(!chain.can_detach_cache());
        assert!(chain.take_cache().is_err());
        assert!(chain.take_multipath().is_err());

        chain.take_origin();
        assert!(!chain.can_detach_cache());
        chain.take_target();
        assert!(chain.can_detach_cache());
        assert!(!chain.can_remove_multipath());

        assert!(chain.take_cache().unwrap().is_some());
        assert!(chain.can_remove_multipath());
        assert_eq!(
            chain.take_multipath().unwrap(),
            Some(PathBuf::from("/dev/mapper/multipath_vol1"))
        );
        assert!(chain.multipath().is_none());
    }
}
