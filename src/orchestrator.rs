//! # Orchestrator
//!
//! Drives variants end to end: compile, scan, validate, patch, and report.
//!
//! Nothing that goes wrong at a single site or pattern stops the run. Failures are logged,
//! recorded in the [`RunReport`], and the next candidate is processed.

use std::collections::BTreeSet;
use std::fmt::{self, Display};

use log::{debug, info, warn};
use thiserror::Error;

use crate::code::x64::JMP_REL8;
use crate::host::{HostModule, RuntimeVersion, TARGET_RUNTIME};
use crate::pattern::{BytePattern, PatternError};
use crate::patcher::{PatchOp, Patcher};
use crate::scan::scan;
use crate::site::{SiteError, SiteValidator, ValidSite, Verdict};
use crate::variant::{Variant, VARIANTS};
use crate::view::MemoryView;

/// Errors at run or variant level
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    /// Selected variant is not in the catalogue
    #[error("unknown variant `{name}`")]
    UnknownVariant {
        /// Requested name
        name: String,
    },
    /// A pattern found nothing
    #[error("pattern `{pattern}` of {variant} returned no results")]
    ScanEmptyResult {
        /// Variant being processed
        variant: &'static str,
        /// Pattern that found nothing
        pattern: &'static str,
    },
}

/// Which variants a run processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    /// One variant. A pattern without matches ends the run.
    Single(String),
    /// Every variant in the catalogue, in name order. Empty scans are skipped.
    All,
}

impl Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(name) => f.write_str(name),
            Self::All => f.write_str("All-Variants"),
        }
    }
}

/// Settings of one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Variants to process
    pub mode: RunMode,
    /// Opcode written at every validated site
    pub replacement: u8,
    /// Build the patterns were made for. A different detected build only warns.
    pub expected_version: RuntimeVersion,
}

impl RunConfig {
    /// Processes only the variant called `name`
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            mode: RunMode::Single(name.into()),
            ..Self::all()
        }
    }

    /// Processes every variant
    pub fn all() -> Self {
        Self {
            mode: RunMode::All,
            replacement: JMP_REL8,
            expected_version: TARGET_RUNTIME,
        }
    }
}

/// How a single pattern went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternOutcome {
    /// Number of matches
    Matched(usize),
    /// Pattern text did not compile
    Invalid(PatternError),
    /// No matches
    Empty(RunError),
}

/// Report for one pattern of a variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternReport {
    /// Pattern text
    pub pattern: &'static str,
    /// What happened
    pub outcome: PatternOutcome,
}

/// How a single match went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteOutcome {
    /// Opcode rewritten
    Patched,
    /// Target already held the replacement opcode
    Unchanged,
    /// Another match of this run already patched the same target
    AlreadyPatched,
    /// Identifier belongs to another variant
    Filtered,
    /// Site failed validation
    Rejected(SiteError),
    /// Patcher refused, e.g. the protection change was denied
    PatchFailed(String),
}

/// Report for one match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteReport {
    /// Address the pattern matched at
    pub match_address: usize,
    /// Byte that was (or would have been) rewritten
    pub target: Option<usize>,
    /// Decoded identifier, if decoding got that far
    pub identifier: Option<String>,
    /// What happened
    pub outcome: SiteOutcome,
}

/// Report for one variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantReport {
    /// Variant name
    pub name: &'static str,
    /// One entry per pattern processed
    pub patterns: Vec<PatternReport>,
    /// One entry per match, in scan order
    pub sites: Vec<SiteReport>,
    /// Number of opcodes rewritten
    pub patched: usize,
}

/// Everything a run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Variants processed, in processing order
    pub variants: Vec<VariantReport>,
    /// Set when a single-variant run stopped on an empty scan
    pub aborted: bool,
}

impl RunReport {
    /// Opcodes rewritten across all variants
    pub fn total_patched(&self) -> usize {
        self.variants.iter().map(|v| v.patched).sum()
    }

    /// Report of the variant called `name`
    pub fn variant(&self, name: &str) -> Option<&VariantReport> {
        self.variants.iter().find(|v| v.name == name)
    }
}

/// Runs variants from a catalogue against a module
pub struct Orchestrator<'c, P> {
    /// Writes the validated sites
    patcher: P,
    /// Run settings
    config: RunConfig,
    /// Variants that can be selected, in processing order
    catalogue: Vec<&'c Variant>,
}

impl<P> Orchestrator<'static, P>
where
    P: Patcher,
    P::Error: Display,
{
    /// Creates an orchestrator over the shipped variants
    pub fn new(patcher: P, config: RunConfig) -> Self {
        Self::with_catalogue(patcher, config, VARIANTS.values())
    }
}

impl<'c, P> Orchestrator<'c, P>
where
    P: Patcher,
    P::Error: Display,
{
    /// Creates an orchestrator over a custom catalogue
    pub fn with_catalogue(
        patcher: P,
        config: RunConfig,
        catalogue: impl IntoIterator<Item = &'c Variant>,
    ) -> Self {
        Self {
            patcher,
            config,
            catalogue: catalogue.into_iter().collect(),
        }
    }

    /// Run settings
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Variants the configured mode selects
    fn selected(&self) -> Result<Vec<&'c Variant>, RunError> {
        match &self.config.mode {
            RunMode::All => Ok(self.catalogue.clone()),
            RunMode::Single(name) => self
                .catalogue
                .iter()
                .find(|v| v.name == name.as_str())
                .map(|v| vec![*v])
                .ok_or_else(|| RunError::UnknownVariant { name: name.clone() }),
        }
    }

    /// Scans and patches `view`, the mapped image of `module`.
    ///
    /// Only an unknown variant name fails the run. Everything else lands in the report.
    ///
    /// # Safety
    ///
    /// `view` must cover live memory of `module` that the patcher may write to,
    /// and nothing may hold Rust references into it while the run is in progress.
    pub unsafe fn run(
        &self,
        module: &HostModule,
        view: MemoryView<'_>,
    ) -> Result<RunReport, RunError> {
        let selected = self.selected()?;
        self.log_host(module);

        let all = self.config.mode == RunMode::All;
        let mut patched_targets = BTreeSet::new();
        let mut report = RunReport::default();

        for variant in selected {
            if all {
                info!("Processing {}", variant.name);
            }
            let (variant_report, aborted) =
                self.run_variant(module, view, variant, &mut patched_targets);
            info!("Patched {} match(es).", variant_report.patched);
            report.variants.push(variant_report);

            if aborted {
                report.aborted = true;
                break;
            }
        }

        if all {
            let done = report.variants.iter().filter(|v| v.patched > 0).count();
            info!(
                "Patched {} section(s), {} match(es) total.",
                done,
                report.total_patched()
            );
        }
        Ok(report)
    }

    /// Logs the module and compares its version with the expected one
    fn log_host(&self, module: &HostModule) {
        let expected = self.config.expected_version;
        info!("Target version: {}", expected);
        match module.version {
            Some(detected) => {
                info!("Game version: {}", detected);
                if detected != expected {
                    warn!("WARNING: TARGET VERSION DOES NOT MATCH DETECTED GAME VERSION! Patching may or may not work.");
                    warn!("If you're deliberately running this on an older release expect zero support and do not open bug reports about it not working.");
                }
            }
            None => warn!("Game version unknown, cannot check it against the target version."),
        }
        info!("Found module name: {}", module.name);
        info!("Module base address: {:X}", module.base);
    }

    /// Processes every pattern of `variant`. Returns the report and whether the run must stop.
    unsafe fn run_variant(
        &self,
        module: &HostModule,
        view: MemoryView<'_>,
        variant: &'c Variant,
        patched_targets: &mut BTreeSet<usize>,
    ) -> (VariantReport, bool) {
        let mut report = VariantReport {
            name: variant.name,
            patterns: Vec::new(),
            sites: Vec::new(),
            patched: 0,
        };
        let validator = SiteValidator::new(view, variant);

        for &text in variant.patterns {
            info!("Doing AoB scan. ({})", text);
            let pattern = match BytePattern::compile(text) {
                Ok(pattern) => pattern,
                Err(e) => {
                    warn!("Pattern `{}` is unusable: {}", text, e);
                    report.patterns.push(PatternReport {
                        pattern: text,
                        outcome: PatternOutcome::Invalid(e),
                    });
                    continue;
                }
            };

            let matches = scan(&view, &pattern);
            if matches.is_empty() {
                let abort = self.config.mode != RunMode::All;
                if abort {
                    info!("AoB scan returned no results, aborting.");
                } else {
                    info!("AoB scan returned no results, skipping.");
                }
                report.patterns.push(PatternReport {
                    pattern: text,
                    outcome: PatternOutcome::Empty(RunError::ScanEmptyResult {
                        variant: variant.name,
                        pattern: text,
                    }),
                });
                if abort {
                    return (report, true);
                }
                continue;
            }

            info!("Found {} match(es).", matches.len());
            report.patterns.push(PatternReport {
                pattern: text,
                outcome: PatternOutcome::Matched(matches.len()),
            });

            for site in matches {
                let site_report =
                    self.process_site(module, view, &validator, site, patched_targets);
                if site_report.outcome == SiteOutcome::Patched {
                    report.patched += 1;
                }
                report.sites.push(site_report);
            }
        }

        (report, false)
    }

    /// Validates and patches one match
    unsafe fn process_site(
        &self,
        module: &HostModule,
        view: MemoryView<'_>,
        validator: &SiteValidator<'_>,
        site: usize,
        patched_targets: &mut BTreeSet<usize>,
    ) -> SiteReport {
        let mut report = SiteReport {
            match_address: site,
            target: None,
            identifier: None,
            outcome: SiteOutcome::Filtered,
        };

        let valid = match validator.validate(site) {
            Ok(Verdict::Eligible(valid)) => valid,
            Ok(Verdict::Filtered { identifier }) => {
                debug!("{:X}: {} is not ours", site, identifier);
                report.identifier = Some(identifier.to_owned());
                return report;
            }
            Err(e) => {
                warn!(
                    "Skipping {:X} ({} + {:X}): {}",
                    site,
                    module.name,
                    module.offset_of(site),
                    e
                );
                if let Ok(identifier) = validator.decode_identifier(site) {
                    report.identifier = Some(identifier.to_owned());
                }
                report.outcome = SiteOutcome::Rejected(e);
                return report;
            }
        };

        report.target = Some(valid.target);
        report.identifier = Some(valid.identifier.to_owned());
        report.outcome = self.apply(module, view, &valid, patched_targets);
        report
    }

    /// Writes the replacement opcode at a validated site
    unsafe fn apply(
        &self,
        module: &HostModule,
        view: MemoryView<'_>,
        valid: &ValidSite<'_>,
        patched_targets: &mut BTreeSet<usize>,
    ) -> SiteOutcome {
        info!(
            "Target address: {:X} ({} + {:X})",
            valid.match_address,
            module.name,
            module.offset_of(valid.match_address)
        );
        if valid.redirected {
            info!("Redirected to {:X}: {}", valid.target, valid.branch);
        } else {
            debug!("Branch: {}", valid.branch);
        }

        if !patched_targets.insert(valid.target) {
            debug!("{:X} was already patched during this run", valid.target);
            return SiteOutcome::AlreadyPatched;
        }

        let target = match view.pointer(valid.target) {
            Ok(target) => target,
            Err(e) => return SiteOutcome::Rejected(e.into()),
        };

        match self.patcher.patch(PatchOp::new(target, self.config.replacement)) {
            Ok(outcome) if outcome.changed => {
                info!("{} patched.", valid.identifier);
                SiteOutcome::Patched
            }
            Ok(_) => {
                info!("{} was already patched.", valid.identifier);
                SiteOutcome::Unchanged
            }
            Err(e) => {
                warn!(
                    "Failed to patch {} at {:X}: {}",
                    valid.identifier, valid.target, e
                );
                // nothing was written, so a later match may try again
                patched_targets.remove(&valid.target);
                SiteOutcome::PatchFailed(e.to_string())
            }
        }
    }
}
