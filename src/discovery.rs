// Address-range scanning and module discovery on top of a `Session`.
//
// Failure isolation is per address: a read that fails on one address marks it
// absent and the scan moves on. The scan only stops early when the caller
// cancels it or the session itself is gone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::pdu::RegisterType;
use crate::session::Session;
use crate::transport::Connector;
use crate::{ConfigError, ConnectionError, DiscoveryError};

/// Inclusive address range. May be inverted; see [`AddressRange::is_valid`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: u16,
    pub end: u16,
}

impl AddressRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Number of addresses covered; zero for an inverted range.
    pub fn count(&self) -> u32 {
        if self.is_valid() {
            (self.end - self.start) as u32 + 1
        } else {
            0
        }
    }
}

/// A named group of contiguous coil addresses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub start_address: u16,
    pub end_address: u16,
}

impl Module {
    pub fn new(name: impl Into<String>, start_address: u16, end_address: u16) -> Self {
        Self {
            name: name.into(),
            start_address,
            end_address,
        }
    }

    pub fn range(&self) -> AddressRange {
        AddressRange::new(self.start_address, self.end_address)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.range().is_valid() {
            return Err(ConfigError::InvertedRange {
                name: self.name.clone(),
                start: self.start_address,
                end: self.end_address,
            });
        }
        Ok(())
    }
}

/// `{"modules": [{"name": .., "start_address": .., "end_address": ..}]}`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub modules: Vec<Module>,
}

/// Named coil addresses of one I/O module.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoilMap {
    pub coil_addresses: BTreeMap<String, u16>,
}

impl CoilMap {
    pub fn address(&self, name: &str) -> Option<u16> {
        self.coil_addresses.get(name).copied()
    }
}

/// Cooperative cancellation flag shared between a scan and whoever may stop it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug)]
pub struct ScanOptions {
    /// Read attempts per address (0 is treated as 1)
    pub retries_per_address: u32,
    /// Delay between scanned addresses in milliseconds
    pub inter_request_delay_ms: u64,
    pub cancel: Option<CancelToken>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            retries_per_address: 1,
            inter_request_delay_ms: 0,
            cancel: None,
        }
    }
}

impl ScanOptions {
    pub fn with_retries(mut self, retries_per_address: u32) -> Self {
        self.retries_per_address = retries_per_address;
        self
    }

    pub fn with_delay_ms(mut self, inter_request_delay_ms: u64) -> Self {
        self.inter_request_delay_ms = inter_request_delay_ms;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Module name to the addresses that answered within its range. Modules with
/// no answering address are absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryResult(BTreeMap<String, BTreeSet<u16>>);

impl DiscoveryResult {
    pub fn get(&self, module: &str) -> Option<&BTreeSet<u16>> {
        self.0.get(module)
    }

    pub fn contains_module(&self, module: &str) -> bool {
        self.0.contains_key(module)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<u16>)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, BTreeSet<u16>> {
        self.0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoilProbe {
    pub present: BTreeSet<u16>,
    pub missing: BTreeSet<u16>,
}

impl<C: Connector> Session<C> {
    /// Probes every address of `range` with a single-point read.
    ///
    /// An inverted range yields an empty set without any request being sent.
    pub fn scan_range(
        &mut self,
        range: AddressRange,
        register_type: RegisterType,
        options: &ScanOptions,
    ) -> BTreeSet<u16> {
        let mut found = BTreeSet::new();
        if !range.is_valid() {
            warn!(
                "[scan] Skipping inverted {} range {}-{}",
                register_type, range.start, range.end
            );
            return found;
        }

        let start_time = Instant::now();
        let attempts = options.retries_per_address.max(1);
        let mut scanned: u32 = 0;

        debug!(
            "[scan] Starting {} scan {}-{} ({} attempts/address)",
            register_type, range.start, range.end, attempts
        );

        for address in range.start..=range.end {
            if options.is_cancelled() {
                warn!("[scan] Cancelled at {} address {}", register_type, address);
                break;
            }
            if !self.is_connected() {
                warn!("[scan] Session lost, stopping at {} address {}", register_type, address);
                break;
            }

            if self.probe_with_retries(register_type, address, attempts) {
                found.insert(address);
            }
            scanned += 1;

            if options.inter_request_delay_ms > 0 && address != range.end {
                thread::sleep(Duration::from_millis(options.inter_request_delay_ms));
            }
        }

        info!(
            "[scan] {} scan {}-{}: {} of {} scanned addresses responded in {}ms",
            register_type,
            range.start,
            range.end,
            found.len(),
            scanned,
            start_time.elapsed().as_millis()
        );
        found
    }

    /// Scans the coil range of every module with default [`ScanOptions`].
    ///
    /// All modules are validated before the first request. A lost session
    /// fails the whole run; no partial result is returned.
    pub fn discover_modules(&mut self, modules: &[Module]) -> Result<DiscoveryResult, DiscoveryError> {
        self.discover_modules_with(modules, &ScanOptions::default())
    }

    pub fn discover_modules_with(
        &mut self,
        modules: &[Module],
        options: &ScanOptions,
    ) -> Result<DiscoveryResult, DiscoveryError> {
        validate_modules(modules)?;
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }

        let mut discovered = BTreeMap::new();
        for module in modules {
            let addresses = self.scan_range(module.range(), RegisterType::Coil, options);

            if options.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }
            if !self.is_connected() {
                return Err(ConnectionError::Lost(format!("while scanning module {}", module.name)).into());
            }

            if addresses.is_empty() {
                debug!("[discovery] Module {} has no responding coils", module.name);
                continue;
            }
            info!("[discovery] Discovered {} at addresses {:?}", module.name, addresses);
            discovered.insert(module.name.clone(), addresses);
        }

        Ok(DiscoveryResult(discovered))
    }

    /// Splits the coil addresses of `map` into present and missing ones.
    pub fn probe_coils(&mut self, map: &CoilMap) -> Result<CoilProbe, DiscoveryError> {
        self.probe_coil_addresses(map.coil_addresses.values().copied(), &ScanOptions::default())
    }

    /// Every address ends up in exactly one of `present` or `missing`. A run
    /// that cannot read them all fails instead of reporting partial results.
    pub fn probe_coil_addresses<I>(&mut self, addresses: I, options: &ScanOptions) -> Result<CoilProbe, DiscoveryError>
    where
        I: IntoIterator<Item = u16>,
    {
        if !self.is_connected() {
            return Err(ConnectionError::NotConnected.into());
        }

        let wanted: BTreeSet<u16> = addresses.into_iter().collect();
        let attempts = options.retries_per_address.max(1);
        let mut probe = CoilProbe::default();

        for address in wanted {
            if options.is_cancelled() {
                warn!("[scan] Coil probe cancelled before address {}", address);
                return Err(DiscoveryError::Cancelled);
            }
            if self.probe_with_retries(RegisterType::Coil, address, attempts) {
                probe.present.insert(address);
            } else if self.is_connected() {
                probe.missing.insert(address);
            } else {
                return Err(ConnectionError::Lost(format!("while probing coil {}", address)).into());
            }
        }

        Ok(probe)
    }

    fn probe_with_retries(&mut self, register_type: RegisterType, address: u16, attempts: u32) -> bool {
        for attempt in 1..=attempts {
            match self.probe(register_type, address) {
                Ok(answered) => return answered,
                Err(e) => {
                    debug!(
                        "[scan] {} address {} attempt {}/{} failed: {}",
                        register_type, address, attempt, attempts, e
                    );
                    if !self.is_connected() {
                        return false;
                    }
                }
            }
        }
        false
    }
}

fn validate_modules(modules: &[Module]) -> Result<(), ConfigError> {
    let mut names = BTreeSet::new();
    for module in modules {
        module.validate()?;
        if !names.insert(module.name.as_str()) {
            return Err(ConfigError::DuplicateModule(module.name.clone()));
        }
    }
    Ok(())
}
