//! Node role ("mode")
//!
//! Written by the dispatcher on `set,<role>`, read when a `start` folder
//! needs its placeholder filled. Readers get an `Arc<str>` snapshot, so a
//! concurrent `set` is either fully visible or not at all.

use std::sync::{Arc, RwLock};

#[derive(Debug)]
pub struct RoleCell {
    current: RwLock<Arc<str>>,
}

impl RoleCell {
    pub fn new(initial: impl Into<Arc<str>>) -> Self {
        Self {
            current: RwLock::new(initial.into()),
        }
    }

    /// Consistent snapshot of the current role.
    pub fn get(&self) -> Arc<str> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            // Writers only swap an Arc, a poisoned lock still holds a whole value
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replace the role, returning the previous one.
    pub fn set(&self, role: impl Into<Arc<str>>) -> Arc<str> {
        let role = role.into();
        match self.current.write() {
            Ok(mut guard) => std::mem::replace(&mut *guard, role),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), role),
        }
    }
}

impl Default for RoleCell {
    fn default() -> Self {
        Self::new("TX")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_returns_previous() {
        let role = RoleCell::new("TX");
        assert_eq!(&*role.set("RX"), "TX");
        assert_eq!(&*role.get(), "RX");
    }

    #[test]
    fn test_concurrent_readers_never_see_torn_values() {
        let role = Arc::new(RoleCell::new("alpha_alpha_alpha"));
        let writer = {
            let role = Arc::clone(&role);
            thread::spawn(move || {
                for i in 0..2_000 {
                    if i % 2 == 0 {
                        role.set("omega_omega_omega_omega");
                    } else {
                        role.set("alpha_alpha_alpha");
                    }
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let role = Arc::clone(&role);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let seen = role.get();
                        assert!(
                            &*seen == "alpha_alpha_alpha" || &*seen == "omega_omega_omega_omega",
                            "torn read: {seen}"
                        );
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
