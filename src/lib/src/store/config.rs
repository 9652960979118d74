//! Configuration for the certificate store

/// Default scratch buffer size. Large enough for every root in common public
/// bundles, including 4096-bit RSA roots with long names.
pub const DEFAULT_MAX_CERTIFICATE_SIZE: usize = 4096;

/// Configuration for a [`CertStore`](super::CertStore)
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Size of the single scratch buffer, in bytes
    ///
    /// A stored certificate longer than this cannot be looked up. This is
    /// the only allocation that scales with certificate size; nothing scales
    /// with the number of stored certificates.
    pub max_certificate_size: usize,

    /// How many consecutive "storage busy" results a read tolerates
    pub read_retries: u32,

    /// Yield to the scheduler between index probes
    pub yield_between_probes: bool,

    /// Walk the whole index during initialization to check ordering and
    /// archive bounds
    ///
    /// Costs one read per record, so it is off by default.
    pub verify_order: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_certificate_size: DEFAULT_MAX_CERTIFICATE_SIZE,
            read_retries: 3,
            yield_between_probes: true,
            verify_order: false,
        }
    }
}

impl StoreConfig {
    /// Create config for small devices sharing a core with other tasks
    pub fn embedded() -> Self {
        Self {
            max_certificate_size: 2048,
            read_retries: 8,
            yield_between_probes: true,
            verify_order: false,
        }
    }

    /// Create config for hosts and CI, where a full index check is cheap
    pub fn development() -> Self {
        Self {
            max_certificate_size: 16 * 1024,
            read_retries: 0,
            yield_between_probes: false,
            verify_order: true,
        }
    }

    /// Set the scratch buffer size
    pub fn with_max_certificate_size(mut self, size: usize) -> Self {
        self.max_certificate_size = size;
        self
    }

    /// Set the busy-retry budget per read
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    /// Enable or disable yielding between probes
    pub fn with_yield_between_probes(mut self, enabled: bool) -> Self {
        self.yield_between_probes = enabled;
        self
    }

    /// Check index ordering during initialization
    pub fn with_order_verification(mut self) -> Self {
        self.verify_order = true;
        self
    }
}
