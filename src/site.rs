//! # Site
//!
//! Every limit check we patch has the same shape:
//!
//! ```text
//! A+0   jcc   rel8                    ; the check, 2 bytes
//! A+2   lea   rdx, [rip + disp32]     ; 48 8D 15 <disp32>, loads the message id
//! A+9   lea   rcx, [rbp + ..]
//! ```
//!
//! `rip + disp32` lands on a length-prefixed, zero-terminated identifier such as
//! `SB_LIMITBODY_MAX_REACTOR`. The identifier tells otherwise identical matches apart.
//!
//! The offsets below describe the code emitted for one specific build of the target and are
//! expected to move when it is recompiled.

use log::{debug, trace};
use thiserror::Error;

use crate::code::x64::{self, MAX_INSTRUCTION_LEN};
use crate::variant::Variant;
use crate::view::{MemoryView, ViewError};

/// Offset from the match to the `disp32` of the message `lea`
pub const DISPLACEMENT_OFFSET: usize = 5;
/// Offset from the match to the identifier text, added to `disp32`.
/// The `lea` ends at +9, and its target is a one byte length prefix.
pub const IDENTIFIER_OFFSET: isize = 10;
/// Longest identifier we read before giving up on finding its terminator
pub const MAX_IDENTIFIER_LEN: usize = 256;

/// Errors that disqualify a single site
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SiteError {
    /// No terminator within [`MAX_IDENTIFIER_LEN`] bytes or before the module ends,
    /// or the text is not UTF-8
    #[error("identifier at {address:#X} is not a terminated string")]
    MalformedIdentifier {
        /// Address the identifier was read from
        address: usize,
    },
    /// Guard byte of a redirected site did not hold the expected opcode
    #[error("expected {expected:02X} at {address:#X}, found {found:02X}")]
    VerificationMismatch {
        /// Address of the guard byte
        address: usize,
        /// Expected opcode
        expected: u8,
        /// Opcode actually present
        found: u8,
    },
    /// Patch target is not a short branch
    #[error("{address:#X} does not hold a short branch (opcode {found:02X})")]
    UnexpectedInstruction {
        /// Patch target
        address: usize,
        /// First byte at the target
        found: u8,
    },
    /// A computed address left the module
    #[error(transparent)]
    OutOfBounds(#[from] ViewError),
}

/// Moves the patch target of sites tagged with `identifier` by `offset` bytes.
/// The byte found there must equal `guard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect {
    /// Identifier the rule applies to
    pub identifier: &'static str,
    /// Distance from the match to the real target
    pub offset: isize,
    /// Opcode expected at the real target
    pub guard: u8,
}

/// A site that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidSite<'a> {
    /// Address the pattern matched at
    pub match_address: usize,
    /// Address of the opcode byte to rewrite
    pub target: usize,
    /// Decoded identifier
    pub identifier: &'a str,
    /// Whether a [`Redirect`] moved the target
    pub redirected: bool,
    /// Branch currently at the target, for logging
    pub branch: String,
}

/// Result of validating a match that could be decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<'a> {
    /// Site belongs to the variant and can be patched
    Eligible(ValidSite<'a>),
    /// Identifier is not one the variant patches
    Filtered {
        /// Decoded identifier
        identifier: &'a str,
    },
}

/// Checks matches of a variant's patterns against its identifier allow-list
pub struct SiteValidator<'a> {
    /// Module being patched
    view: MemoryView<'a>,
    /// Variant that produced the matches
    variant: &'a Variant,
}

impl<'a> SiteValidator<'a> {
    /// Creates a validator for matches of `variant` inside `view`
    pub fn new(view: MemoryView<'a>, variant: &'a Variant) -> Self {
        Self { view, variant }
    }

    /// Reads the identifier referenced by the `lea` of the site at `site`
    pub fn decode_identifier(&self, site: usize) -> Result<&'a str, SiteError> {
        let field = MemoryView::displace(site, DISPLACEMENT_OFFSET as isize)?;
        let displacement = self.view.read_i32_le(field)?;
        // TODO: check that the string lands in a data section of the module rather than anywhere in the view
        let start = MemoryView::displace(site, displacement as isize + IDENTIFIER_OFFSET)?;
        trace!("String addr: {:X} (disp {:X})", start, displacement);

        let raw = self
            .view
            .read_until_nul(start, MAX_IDENTIFIER_LEN)?
            .ok_or(SiteError::MalformedIdentifier { address: start })?;
        std::str::from_utf8(raw).map_err(|_| SiteError::MalformedIdentifier { address: start })
    }

    /// Decodes the site's identifier, filters it through the allow-list and resolves the final patch target
    pub fn validate(&self, site: usize) -> Result<Verdict<'a>, SiteError> {
        let identifier = self.decode_identifier(site)?;
        if !self.variant.allows(identifier) {
            return Ok(Verdict::Filtered { identifier });
        }

        let (target, redirected) = match self.variant.redirect_for(identifier) {
            Some(redirect) => (self.check_redirect(site, redirect)?, true),
            None => (site, false),
        };

        let branch = self.check_branch(target)?;
        Ok(Verdict::Eligible(ValidSite {
            match_address: site,
            target,
            identifier,
            redirected,
            branch,
        }))
    }

    /// Applies `redirect` to `site` and verifies its guard byte
    fn check_redirect(&self, site: usize, redirect: &Redirect) -> Result<usize, SiteError> {
        let target = MemoryView::displace(site, redirect.offset)?;
        let found = self.view.read_u8(target)?;
        if found != redirect.guard {
            return Err(SiteError::VerificationMismatch {
                address: target,
                expected: redirect.guard,
                found,
            });
        }
        debug!(
            "Redirected {} site {:X} to {:X} ({:+})",
            redirect.identifier, site, target, redirect.offset
        );
        Ok(target)
    }

    /// Makes sure `target` holds a branch whose opcode can be swapped, returning its disassembly
    fn check_branch(&self, target: usize) -> Result<String, SiteError> {
        let available = self.view.end().saturating_sub(target).min(MAX_INSTRUCTION_LEN);
        let code = self.view.bytes(target, available)?;
        let instruction = x64::decode(code, target as u64);

        if !x64::is_short_branch(&instruction) {
            return Err(SiteError::UnexpectedInstruction {
                address: target,
                found: code.first().copied().unwrap_or_default(),
            });
        }
        Ok(instruction.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{SiteError, SiteValidator, Verdict, MAX_IDENTIFIER_LEN};
    use crate::testing::limit_check;
    use crate::variant::{Variant, EXCESS_POWER_WEAPON, WEAPON_POWER_REDIRECT};
    use crate::view::{MemoryView, ViewError};

    const REACTOR: Variant = Variant {
        name: "Reactor-Count-Mod",
        patterns: &["7E ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 50"],
        identifiers: &["SB_LIMITBODY_MAX_REACTOR"],
        redirects: &[],
    };

    const WEAPON: Variant = Variant {
        name: "Weapon-Power-Mod",
        patterns: &["EB ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 30"],
        identifiers: &[EXCESS_POWER_WEAPON],
        redirects: &[WEAPON_POWER_REDIRECT],
    };

    #[test]
    /// Allowed identifier makes the match itself the target
    fn test_eligible() {
        let data = limit_check(0x7E, 0x50, "SB_LIMITBODY_MAX_REACTOR");
        let view = MemoryView::from_slice(&data);
        let validator = SiteValidator::new(view, &REACTOR);

        assert_eq!(
            validator.decode_identifier(view.base()).unwrap(),
            "SB_LIMITBODY_MAX_REACTOR"
        );
        match validator.validate(view.base()).unwrap() {
            Verdict::Eligible(site) => {
                assert_eq!(site.target, view.base());
                assert_eq!(site.match_address, view.base());
                assert_eq!(site.identifier, "SB_LIMITBODY_MAX_REACTOR");
                assert!(!site.redirected);
                assert!(site.branch.starts_with("jle"), "{}", site.branch);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    /// Identifiers outside the allow-list are filtered, not errors
    fn test_filtered() {
        let data = limit_check(0x7E, 0x50, "SB_OTHER");
        let view = MemoryView::from_slice(&data);
        let validator = SiteValidator::new(view, &REACTOR);

        assert_eq!(
            validator.validate(view.base()).unwrap(),
            Verdict::Filtered {
                identifier: "SB_OTHER"
            }
        );
    }

    #[test]
    /// Unterminated identifiers are malformed
    fn test_malformed() {
        let long = "A".repeat(MAX_IDENTIFIER_LEN + 10);
        let data = limit_check(0x7E, 0x50, &long);
        let view = MemoryView::from_slice(&data);
        let validator = SiteValidator::new(view, &REACTOR);

        assert_eq!(
            validator.validate(view.base()),
            Err(SiteError::MalformedIdentifier {
                address: view.base() + 14
            })
        );

        // module ends before the terminator
        let data = limit_check(0x7E, 0x50, "SB_LIMITBODY_MAX_REACTOR");
        let view = MemoryView::from_slice(&data[..data.len() - 1]);
        let validator = SiteValidator::new(view, &REACTOR);
        assert_eq!(
            validator.validate(view.base()),
            Err(SiteError::MalformedIdentifier {
                address: view.base() + 14
            })
        );

        // not UTF-8
        let mut data = limit_check(0x7E, 0x50, "SB_X");
        data[14] = 0xFF;
        let view = MemoryView::from_slice(&data);
        let validator = SiteValidator::new(view, &REACTOR);
        assert!(matches!(
            validator.validate(view.base()),
            Err(SiteError::MalformedIdentifier { .. })
        ));
    }

    #[test]
    /// Displacements pointing outside the module are rejected without reading there
    fn test_displacement_out_of_view() {
        let mut data = limit_check(0x7E, 0x50, "SB_LIMITBODY_MAX_REACTOR");
        data[5..9].copy_from_slice(&0x1000_0000i32.to_le_bytes());
        let view = MemoryView::from_slice(&data);
        let validator = SiteValidator::new(view, &REACTOR);

        assert!(matches!(
            validator.validate(view.base()),
            Err(SiteError::OutOfBounds(ViewError::OutOfBounds { .. }))
        ));

        // match too close to the end for the displacement field
        let validator = SiteValidator::new(MemoryView::from_slice(&data[..7]), &REACTOR);
        assert!(validator.validate(view.base()).is_err());
    }

    #[test]
    /// Redirected sites move the target onto the guarded `je`
    fn test_redirect() {
        let mut data = vec![0x90u8; 16];
        data[16 - 11] = 0x74;
        data[16 - 10] = 0x20;
        data.extend(limit_check(0xEB, 0x30, EXCESS_POWER_WEAPON));
        let view = MemoryView::from_slice(&data);
        let site = view.base() + 16;
        let validator = SiteValidator::new(view, &WEAPON);

        match validator.validate(site).unwrap() {
            Verdict::Eligible(valid) => {
                assert_eq!(valid.target, site - 11);
                assert!(valid.redirected);
                assert!(valid.branch.starts_with("je"), "{}", valid.branch);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    /// A wrong guard byte rejects the site
    fn test_redirect_mismatch() {
        let mut data = vec![0x90u8; 16];
        data[16 - 11] = 0x75;
        data.extend(limit_check(0xEB, 0x30, EXCESS_POWER_WEAPON));
        let view = MemoryView::from_slice(&data);
        let site = view.base() + 16;
        let validator = SiteValidator::new(view, &WEAPON);

        assert_eq!(
            validator.validate(site),
            Err(SiteError::VerificationMismatch {
                address: site - 11,
                expected: 0x74,
                found: 0x75
            })
        );

        // guard would sit before the start of the module
        let view = MemoryView::from_slice(&data[16..]);
        let validator = SiteValidator::new(view, &WEAPON);
        assert!(matches!(
            validator.validate(view.base()),
            Err(SiteError::OutOfBounds(_))
        ));
    }

    #[test]
    /// Targets that are not short branches are rejected
    fn test_unexpected_instruction() {
        let data = limit_check(0x90, 0x50, "SB_LIMITBODY_MAX_REACTOR");
        let view = MemoryView::from_slice(&data);
        let validator = SiteValidator::new(view, &REACTOR);

        assert_eq!(
            validator.validate(view.base()),
            Err(SiteError::UnexpectedInstruction {
                address: view.base(),
                found: 0x90
            })
        );
    }
}
