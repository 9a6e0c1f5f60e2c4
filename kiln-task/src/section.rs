//! Scoped CPU profiler sections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use kiln_memory::InternedString;
use once_cell::sync::Lazy;

static SECTIONS: Lazy<Mutex<HashMap<InternedString, &'static CpuSection>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Named accumulator of time spent inside a profiled scope.
///
/// Sections are interned per name and live for the whole process, so
/// timer guards can reference them without lifetimes.
pub struct CpuSection {
    name: InternedString,
    total_nanos: AtomicU64,
    executions: AtomicU64,
}

impl CpuSection {
    pub fn name(&self) -> InternedString {
        self.name
    }

    /// Starts timing; the returned guard reports on drop.
    pub fn enter(&'static self) -> SectionTimer {
        SectionTimer {
            section: self,
            started: Instant::now(),
        }
    }

    pub fn total_nanos(&self) -> u64 {
        self.total_nanos.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

/// Returns the process-wide section registered under `name`.
pub fn section(name: InternedString) -> &'static CpuSection {
    let mut sections = SECTIONS.lock().unwrap();
    *sections.entry(name).or_insert_with(|| {
        Box::leak(Box::new(CpuSection {
            name,
            total_nanos: AtomicU64::new(0),
            executions: AtomicU64::new(0),
        }))
    })
}

/// Guard measuring one execution of a section.
pub struct SectionTimer {
    section: &'static CpuSection,
    started: Instant,
}

impl Drop for SectionTimer {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed().as_nanos() as u64;
        self.section.total_nanos.fetch_add(elapsed, Ordering::Relaxed);
        self.section.executions.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_accumulate() {
        let name = InternedString::intern("section_test_accumulate");
        {
            let _timer = section(name).enter();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        {
            let _timer = section(name).enter();
        }
        let stats = section(name);
        assert_eq!(stats.executions(), 2);
        assert!(stats.total_nanos() >= 1_000_000);
    }

    #[test]
    fn sections_are_interned_per_name() {
        let name = InternedString::intern("section_test_identity");
        let a = section(name) as *const CpuSection;
        let b = section(name) as *const CpuSection;
        assert_eq!(a, b);
    }
}
