//! Process-wide driver library state.
//!
//! Vendor driver libraries must be initialized once before any device is opened and finalized
//! once after the last device is closed. [`DriverLibrary`] counts open devices per driver type;
//! every open device holds a [`LibraryHandle`], and dropping the last handle of a driver type
//! finalizes it.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use crate::Result;
use crate::sys::Driver;

#[derive(Debug, Default)]
pub struct DriverLibrary {
    open_counts: Mutex<HashMap<TypeId, usize>>,
}

impl DriverLibrary {
    pub fn global() -> &'static DriverLibrary {
        static LIBRARY: OnceLock<DriverLibrary> = OnceLock::new();
        LIBRARY.get_or_init(DriverLibrary::default)
    }

    fn counts(&self) -> MutexGuard<'_, HashMap<TypeId, usize>> {
        self.open_counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers one more open device of driver type `D`, initializing the library if it is the
    /// first one.
    pub fn open<D: Driver>(&'static self) -> Result<LibraryHandle> {
        let mut counts = self.counts();
        let count = counts.entry(TypeId::of::<D>()).or_insert(0);
        if *count == 0 {
            log::debug!("initializing driver library {}", std::any::type_name::<D>());
            D::initialize()?;
        }
        *count += 1;
        Ok(LibraryHandle { library: self, driver: TypeId::of::<D>(), finalize: D::finalize })
    }

    /// Number of open devices of driver type `D`.
    pub fn open_count<D: Driver>(&self) -> usize {
        self.counts().get(&TypeId::of::<D>()).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct LibraryHandle {
    library: &'static DriverLibrary,
    driver: TypeId,
    finalize: fn() -> Result<()>,
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        let mut counts = self.library.counts();
        let Some(count) = counts.get_mut(&self.driver) else { return };
        *count -= 1;
        if *count == 0 {
            counts.remove(&self.driver);
            log::debug!("finalizing driver library");
            if let Err(error) = (self.finalize)() {
                log::error!("cannot finalize driver library: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static INITIALIZED: AtomicUsize = AtomicUsize::new(0);
    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    struct CountingDriver;

    impl Driver for CountingDriver {
        fn reset(&self) -> Result<()> { Ok(()) }
        fn run(&self) -> Result<()> { Ok(()) }
        fn read_scalar(&self, _addr: u32) -> Result<u32> { Ok(0) }
        fn write_scalar(&self, _addr: u32, _value: u32) -> Result<()> { Ok(()) }
        fn start_stream(&self, _stream: u32) -> Result<()> { Ok(()) }
        fn stop_stream(&self, _stream: u32) -> Result<()> { Ok(()) }
        fn read_stream(&self, _stream: u32, _data: &mut [u32], _timeout: Duration)
                -> Result<usize> { Ok(0) }
        fn write_stream(&self, _stream: u32, _data: &[u32], _timeout: Duration)
                -> Result<usize> { Ok(0) }

        fn initialize() -> Result<()> {
            INITIALIZED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finalize() -> Result<()> {
            FINALIZED.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_reference_counting() {
        let library = DriverLibrary::global();
        let first = library.open::<CountingDriver>().unwrap();
        let second = library.open::<CountingDriver>().unwrap();
        assert_eq!(INITIALIZED.load(Ordering::SeqCst), 1);
        assert_eq!(library.open_count::<CountingDriver>(), 2);
        drop(first);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
        assert_eq!(library.open_count::<CountingDriver>(), 0);

        let _third = library.open::<CountingDriver>().unwrap();
        assert_eq!(INITIALIZED.load(Ordering::SeqCst), 2);
    }
}
