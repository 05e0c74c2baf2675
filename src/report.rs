//! Shutdown leak report.
//!
//! A [`LeakReport`] is captured from a copy of the live map, so the store's lock is never held
//! while memory is dumped or text is written.  The report can be rendered as text (its `Display`
//! implementation) or serialized to YAML and rendered later by `ml_print`.

use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    path::Path,
};

use backtrace::SymbolName;
use libc::c_void;
use serde::{Deserialize, Serialize};

use crate::stats::{Address, Category, CategoryCounters, Statistics};

/// Source of the bytes shown in a leak's hex dump.
pub trait MemoryView {
    fn read(&self, address: Address, size: u64) -> Vec<u8>;
}

/// Reads leaked blocks straight out of the current process.
#[derive(Debug)]
pub struct ProcessMemory(());

impl ProcessMemory {
    /// # Safety
    ///
    /// Every non-null address passed to [`MemoryView::read`] must point to at least `size`
    /// readable bytes.  This holds for live-map entries as long as the tracked program honors
    /// the allocator contract.
    pub unsafe fn new() -> Self {
        ProcessMemory(())
    }
}

impl MemoryView for ProcessMemory {
    fn read(&self, address: Address, size: u64) -> Vec<u8> {
        if address == 0 || size == 0 {
            return Vec::new();
        }
        let len = match usize::try_from(size) {
            Ok(len) => len,
            Err(_) => return Vec::new(),
        };
        unsafe { std::slice::from_raw_parts(address as *const u8, len) }.to_vec()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leak {
    pub address: Address,
    pub size: u64,
    pub caller: Option<Address>,
    /// Contents of the block when the report was captured.
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub malloc: CategoryCounters,
    pub calloc: CategoryCounters,
    pub realloc: CategoryCounters,
}

impl Totals {
    pub fn get(&self, category: Category) -> CategoryCounters {
        match category {
            Category::Malloc => self.malloc,
            Category::Calloc => self.calloc,
            Category::Realloc => self.realloc,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    /// Leaks ordered by address.
    pub leaks: Vec<Leak>,
    pub totals: Totals,
    /// Symbol names for caller addresses, when they could be resolved.
    #[serde(default)]
    pub symbols: HashMap<Address, String>,
}

impl LeakReport {
    pub fn capture(stats: &Statistics, memory: &dyn MemoryView) -> Self {
        let live = stats.clone_live_map();
        let mut leaks: Vec<Leak> = live
            .into_iter()
            .map(|(address, record)| Leak {
                address,
                size: record.size,
                caller: record.caller,
                bytes: memory.read(address, record.size),
            })
            .collect();
        leaks.sort_by_key(|leak| leak.address);

        LeakReport {
            leaks,
            totals: Totals {
                malloc: stats.counters(Category::Malloc),
                calloc: stats.counters(Category::Calloc),
                realloc: stats.counters(Category::Realloc),
            },
            symbols: HashMap::new(),
        }
    }

    pub fn leak_count(&self) -> usize {
        self.leaks.len()
    }

    pub fn leaked_bytes(&self) -> u64 {
        self.leaks
            .iter()
            .fold(0u64, |total, leak| total.wrapping_add(leak.size))
    }

    /// Resolves caller addresses to symbol names.
    /// Must be called while running in the context of the tracked program.
    pub fn resolve_symbols(&mut self) {
        for caller in self.leaks.iter().filter_map(|leak| leak.caller) {
            if self.symbols.contains_key(&caller) {
                continue;
            }
            if let Some(sym) = resolve(caller) {
                self.symbols.insert(caller, sym);
            }
        }
    }

    /// Text rendering that appends resolved symbol names to caller addresses.
    pub fn with_symbols(&self) -> WithSymbols<'_> {
        WithSymbols(self)
    }

    fn render(&self, f: &mut Formatter<'_>, symbols: bool) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "SUMMARY START")?;

        if self.leaks.is_empty() {
            writeln!(f)?;
            writeln!(f, "NO LEAKS FOUND!")?;
        } else {
            writeln!(f)?;
            writeln!(f, "Leaks dumped:")?;
            for (idx, leak) in self.leaks.iter().enumerate() {
                writeln!(f, "{:>5}.) Address  : {:#x}", idx + 1, leak.address)?;
                write!(f, "{:8}Hex dump : ", "")?;
                for (i, byte) in leak.bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                writeln!(f)?;
                writeln!(f, "{:8}Bytes    : {}", "", leak.size)?;
                write!(f, "{:8}Backtrace: ", "")?;
                match leak.caller {
                    Some(caller) => {
                        write!(f, "{:#x}", caller)?;
                        if let Some(sym) = self.symbols.get(&caller).filter(|_| symbols) {
                            write!(f, " {}", sym)?;
                        }
                    }
                    None => f.write_str("unavailable")?,
                }
                writeln!(f)?;
            }
            writeln!(f)?;
            writeln!(
                f,
                "Leaks count {}, bytes leaked {}",
                self.leak_count(),
                self.leaked_bytes()
            )?;
        }

        writeln!(f)?;
        writeln!(f, "In detail:")?;
        let rows = [
            ("malloc's  count", u64::from(self.totals.malloc.count)),
            ("calloc's  count", u64::from(self.totals.calloc.count)),
            ("realloc's count", u64::from(self.totals.realloc.count)),
            ("malloced  bytes", self.totals.malloc.bytes),
            ("calloced  bytes", self.totals.calloc.bytes),
            ("realloced bytes", self.totals.realloc.bytes),
        ];
        for (label, value) in rows.iter() {
            writeln!(f, "{:4}{}: {:>6}", "", label, value)?;
        }

        writeln!(f)?;
        writeln!(f, "SUMMARY END")
    }
}

impl Display for LeakReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.render(f, false)
    }
}

#[derive(Debug)]
pub struct WithSymbols<'a>(&'a LeakReport);

impl Display for WithSymbols<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.render(f, true)
    }
}

// Convert a code address into a symbol description.
fn resolve(frame: Address) -> Option<String> {
    let mut sym = None;
    backtrace::resolve(frame as *mut c_void, |s| {
        if sym.is_some() {
            return;
        }
        sym = Some(format!(
            "{} (in {}:{})",
            s.name().unwrap_or_else(|| SymbolName::new(&[])),
            s.filename().unwrap_or_else(|| Path::new("")).display(),
            s.lineno().unwrap_or(0)
        ))
    });
    sym
}
