//! # Variant
//!
//! Named patch configurations. Each one pairs the byte patterns that find a family of limit
//! checks with the identifiers that mark the checks it is allowed to disable.

use std::collections::BTreeMap;

use lazy_static::lazy_static;

use crate::code::x64::JE_REL8;
use crate::site::Redirect;

/// Immutable patch configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Variant {
    /// Name used to select the variant
    pub name: &'static str,
    /// Textual patterns, scanned in order
    pub patterns: &'static [&'static str],
    /// Identifiers whose sites may be patched
    pub identifiers: &'static [&'static str],
    /// Identifiers whose real patch target is somewhere other than the match
    pub redirects: &'static [Redirect],
}

impl Variant {
    /// Whether sites tagged with `identifier` belong to this variant
    pub fn allows(&self, identifier: &str) -> bool {
        self.identifiers.contains(&identifier)
    }

    /// Redirect rule for `identifier`, if any
    pub fn redirect_for(&self, identifier: &str) -> Option<&Redirect> {
        self.redirects.iter().find(|r| r.identifier == identifier)
    }
}

/// Identifier of the weapon power check that shares its `jmp` with an earlier `je`
pub const EXCESS_POWER_WEAPON: &str = "SB_LIMITBODY_EXCESS_POWER_WEAPON";

/// Weapon power sites match on a `jmp`, but the check is the `je` four instructions earlier.
///
/// Tied to the current code layout of the target build, recheck after every game update.
pub const WEAPON_POWER_REDIRECT: Redirect = Redirect {
    identifier: EXCESS_POWER_WEAPON,
    offset: -11,
    guard: JE_REL8,
};

/// Every shipped variant, before indexing by name
const SHIPPED: &[Variant] = &[
    // GravDrive-Count-Mod stays off: patching SB_LIMITBODY_MAX_GRAV_DRIVE only trades the limit
    // for an "additional grav thrust" error.
    Variant {
        name: "GravDrive-Weight-Mod",
        // 73 == `jae`
        patterns: &["73 ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 30"],
        identifiers: &["SB_ERRORBODY_SHIP_TOO_HEAVY_TO_GRAVJUMP"],
        redirects: &[],
    },
    Variant {
        name: "LandingGear-Count-Mod",
        // 75 == `jne`
        patterns: &["75 ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 50"],
        identifiers: &["SB_LIMITBODY_MIN_LANDING_GEAR"],
        redirects: &[],
    },
    Variant {
        name: "Reactor-Count-Mod",
        // 7E == `jle`
        patterns: &["7E ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 50"],
        identifiers: &["SB_LIMITBODY_MAX_REACTOR"],
        redirects: &[],
    },
    Variant {
        name: "Reactor-Class-Mod",
        patterns: &["75 ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 50"],
        identifiers: &["SB_ERRORBODY_REACTOR_CLASS"],
        redirects: &[],
    },
    Variant {
        name: "Shield-Count-Mod",
        patterns: &["7E ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 50"],
        identifiers: &["SB_LIMITBODY_MAX_SHIELD"],
        redirects: &[],
    },
    Variant {
        name: "Engine-Power-Mod",
        patterns: &["7E ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 30"],
        identifiers: &["SB_LIMITBODY_EXCESS_POWER_ENGINE"],
        redirects: &[],
    },
    Variant {
        name: "Weapon-Power-Mod",
        // EB == `jmp`
        patterns: &[
            "EB ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 30",
            "7E ?? 48 8D 15 ?? ?? ?? ?? 48 8D 4D 50",
        ],
        identifiers: &[EXCESS_POWER_WEAPON, "SB_LIMITBODY_MAX_WEAPONS"],
        redirects: &[WEAPON_POWER_REDIRECT],
    },
];

lazy_static! {
    /// Shipped variants by name. Built once, never mutated.
    pub static ref VARIANTS: BTreeMap<&'static str, Variant> =
        SHIPPED.iter().map(|v| (v.name, *v)).collect();
}

/// Looks up a shipped variant
pub fn find(name: &str) -> Option<&'static Variant> {
    VARIANTS.get(name)
}
