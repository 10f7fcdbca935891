//! AmneziaWG obfuscation parameters
//!
//! The obfuscated variant pads handshakes with junk packets and rewrites the
//! message type headers. The parameter block must be identical on both ends
//! of a tunnel, so it is validated strictly before it reaches `awg`.

use crate::error::{BrgError, Result};
use serde::{Deserialize, Serialize};

/// Largest junk packet size accepted by AmneziaWG
pub const MAX_JUNK_SIZE: u16 = 1280;

/// Upper bound for the init packet padding (`1280 - 148`)
pub const MAX_INIT_PADDING: u16 = 1132;

/// Upper bound for the response packet padding (`1280 - 92`)
pub const MAX_RESPONSE_PADDING: u16 = 1188;

/// Obfuscation parameter block for AmneziaWG interfaces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationParams {
    /// Number of junk packets sent before the handshake
    pub jc: u8,
    /// Minimum junk packet size
    pub jmin: u16,
    /// Maximum junk packet size
    pub jmax: u16,
    /// Init packet junk prefix size
    pub s1: u16,
    /// Response packet junk prefix size
    pub s2: u16,
    /// Init packet magic header
    pub h1: u32,
    /// Response packet magic header
    pub h2: u32,
    /// Cookie packet magic header
    pub h3: u32,
    /// Transport packet magic header
    pub h4: u32,
}

impl ObfuscationParams {
    /// Generate a random, valid parameter block
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let jmin = rng.gen_range(40..=80);
        let jmax = rng.gen_range(jmin + 1..=MAX_JUNK_SIZE.min(jmin + 1000));
        let s1 = rng.gen_range(15..=150);
        let mut s2 = rng.gen_range(15..=150);
        if s1 + 56 == s2 {
            s2 += 1;
        }

        let mut headers = Vec::with_capacity(4);
        while headers.len() < 4 {
            let h: u32 = rng.gen_range(5..=u32::MAX);
            if !headers.contains(&h) {
                headers.push(h);
            }
        }

        Self {
            jc: rng.gen_range(3..=10),
            jmin,
            jmax,
            s1,
            s2,
            h1: headers[0],
            h2: headers[1],
            h3: headers[2],
            h4: headers[3],
        }
    }

    /// Validate the block against AmneziaWG's constraints
    pub fn validate(&self) -> Result<()> {
        if !(1..=128).contains(&self.jc) {
            return Err(BrgError::InvalidArgument(format!(
                "jc {} is out of valid range (1-128)",
                self.jc
            )));
        }

        if self.jmin >= self.jmax || self.jmax > MAX_JUNK_SIZE {
            return Err(BrgError::InvalidArgument(format!(
                "junk size bounds must satisfy jmin < jmax <= {} (got {}..{})",
                MAX_JUNK_SIZE, self.jmin, self.jmax
            )));
        }

        if self.s1 > MAX_INIT_PADDING {
            return Err(BrgError::InvalidArgument(format!(
                "s1 {} exceeds maximum {}",
                self.s1, MAX_INIT_PADDING
            )));
        }

        if self.s2 > MAX_RESPONSE_PADDING {
            return Err(BrgError::InvalidArgument(format!(
                "s2 {} exceeds maximum {}",
                self.s2, MAX_RESPONSE_PADDING
            )));
        }

        // Equal on-wire sizes would make init and response packets indistinguishable
        if self.s1 + 56 == self.s2 {
            return Err(BrgError::InvalidArgument(
                "s1 + 56 must not equal s2".to_string(),
            ));
        }

        let headers = self.headers();
        for (i, h) in headers.iter().enumerate() {
            if (1..=4).contains(h) {
                return Err(BrgError::InvalidArgument(format!(
                    "h{} must not be one of the standard message types 1-4",
                    i + 1
                )));
            }
            if headers[..i].contains(h) {
                return Err(BrgError::InvalidArgument(format!(
                    "h{} duplicates another header value ({})",
                    i + 1,
                    h
                )));
            }
        }

        Ok(())
    }

    /// Header markers in order h1..h4
    pub fn headers(&self) -> [u32; 4] {
        [self.h1, self.h2, self.h3, self.h4]
    }

    /// Arguments for `awg set <iface> ...`
    pub fn to_set_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(18);
        for (name, value) in [
            ("jc", self.jc as u64),
            ("jmin", self.jmin as u64),
            ("jmax", self.jmax as u64),
            ("s1", self.s1 as u64),
            ("s2", self.s2 as u64),
            ("h1", self.h1 as u64),
            ("h2", self.h2 as u64),
            ("h3", self.h3 as u64),
            ("h4", self.h4 as u64),
        ] {
            args.push(name.to_string());
            args.push(value.to_string());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObfuscationParams {
        ObfuscationParams {
            jc: 4,
            jmin: 40,
            jmax: 70,
            s1: 30,
            s2: 40,
            h1: 1_234_567,
            h2: 7_654_321,
            h3: 1_122_334,
            h4: 4_433_221,
        }
    }

    #[test]
    fn test_sample_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_generated_params_are_valid() {
        for _ in 0..64 {
            assert!(ObfuscationParams::generate().validate().is_ok());
        }
    }

    #[test]
    fn test_rejects_bad_junk_bounds() {
        let mut p = sample();
        p.jmin = 70;
        assert!(p.validate().is_err());

        let mut p = sample();
        p.jmax = 1281;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_padding_collision() {
        let mut p = sample();
        p.s2 = p.s1 + 56;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_rejects_standard_or_duplicate_headers() {
        let mut p = sample();
        p.h3 = 2;
        assert!(p.validate().is_err());

        let mut p = sample();
        p.h4 = p.h1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_set_args_layout() {
        let args = sample().to_set_args();
        assert_eq!(args.len(), 18);
        assert_eq!(&args[0..2], &["jc".to_string(), "4".to_string()]);
        assert_eq!(args[17], "4433221");
    }
}
