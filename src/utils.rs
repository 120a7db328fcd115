use rand::Rng;
use std::sync::atomic::{AtomicU16, Ordering};

const PAYLOAD_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";

/// Hands out ICMP identifiers. Pass one around instead of relying on a
/// process-wide counter so tests can pick their own.
#[derive(Debug)]
pub struct IdentifierSource {
    next: AtomicU16,
}

impl IdentifierSource {
    pub fn fixed(base: u16) -> Self {
        Self {
            next: AtomicU16::new(base),
        }
    }

    /// Seeded from the process id, like classic ping.
    pub fn from_process() -> Self {
        Self::fixed((std::process::id() & 0xffff) as u16)
    }

    pub fn random() -> Self {
        Self::fixed(generate_identifier())
    }

    pub fn next(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserves `count` consecutive identifiers and returns the first.
    pub fn reserve(&self, count: usize) -> u16 {
        self.next.fetch_add((count & 0xffff) as u16, Ordering::Relaxed)
    }
}

/// Generate a random identifier for ICMP packets
pub fn generate_identifier() -> u16 {
    rand::thread_rng().gen_range(1..=65535)
}

/// Printable random bytes used when a request has no explicit payload.
pub fn random_payload(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size)
        .map(|_| PAYLOAD_ALPHABET[rng.gen_range(0..PAYLOAD_ALPHABET.len())])
        .collect()
}

/// Validate probe parameters before any socket is opened
pub fn validate_params(
    count: Option<u32>,
    size: Option<u32>,
    timeout_ms: Option<u64>,
    ttl: Option<u32>,
) -> anyhow::Result<()> {
    if let Some(size) = size {
        if size > 65500 {
            return Err(anyhow::anyhow!("Payload too large, the maximum is 65500 bytes"));
        }
    }

    if let Some(count) = count {
        if count == 0 {
            return Err(anyhow::anyhow!("Count must be greater than 0"));
        }
    }

    if let Some(timeout) = timeout_ms {
        if timeout == 0 {
            return Err(anyhow::anyhow!("Timeout must be greater than 0"));
        }
    }

    if let Some(ttl) = ttl {
        if ttl == 0 || ttl > 255 {
            return Err(anyhow::anyhow!("TTL must be in the range 1-255"));
        }
    }

    Ok(())
}

/// Print an error message and exit
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("ruicmp: {}", message);
    std::process::exit(code);
}

/// Format time duration for display
pub fn format_time(ms: f64) -> String {
    if ms < 1.0 {
        "<1ms".to_string()
    } else {
        format!("{:.0}ms", ms)
    }
}
