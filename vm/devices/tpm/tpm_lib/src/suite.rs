// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The test registry.
//!
//! A [`TestRegistry`] is an ordered list of [`TestCase`]s run one after
//! another against a single [`TestContext`]. A failing case never stops the
//! run; every case produces a [`TestReport`].

use crate::TestContext;
use crate::TpmEngine;
use crate::WorkflowError;
use crate::hierarchy::KeyHierarchy;
use crate::hierarchy::KeyHierarchyReport;
use crate::hierarchy::run_primary_sign;
use crate::nv::DefineOutcome;
use crate::nv::NvIndexDescriptor;
use crate::nv::NvWorkflow;
use crate::profile::AlgorithmProfile;
use crate::profile::HASH_TEST_MESSAGE;
use crate::replay::replay_hex;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tpm_protocol::TPM_NV_TEST_DATA;
use tpm_protocol::marshal::PcrSelection;
use tpm_protocol::response::CapabilityData;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::DecodedResponseCode;
use tpm_protocol::tpm20proto::ResponseCode;
use tpm_protocol::tpm20proto::StartupType;
use tpm_protocol::tpm20proto::TPM20_CAP_TPM_PROPERTIES;
use tpm_protocol::tpm20proto::TPM20_PT_FIXED;
use tpm_protocol::tpm20proto::TPM20_RH_OWNER;

const RANDOM_BYTES: u16 = 16;
const PCR_SELECT_SIZE: u8 = 3;

/// GetRandom for 8 bytes, replayed by the standard registry.
pub const REPLAY_GET_RANDOM: &str = "80 01 00 00 00 0c 00 00 01 7b 00 08";

/// Result of one test.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// Completed as expected.
    Passed,
    /// Completed, but with something worth a look.
    Warning,
    /// The TPM rejected a command or returned the wrong data.
    Failed,
    /// The TPM does not implement an algorithm the test needs.
    Skipped,
}

impl TestOutcome {
    /// Short label used in summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Passed => "pass",
            TestOutcome::Warning => "warn",
            TestOutcome::Failed => "fail",
            TestOutcome::Skipped => "skip",
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestReport {
    /// Test name.
    pub name: String,
    /// Overall result.
    pub outcome: TestOutcome,
    /// One line describing the result.
    pub detail: String,
    /// Response code of the command that failed, if one did.
    pub response_code: Option<u32>,
}

impl TestReport {
    fn new(name: &str, outcome: TestOutcome, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_owned(),
            outcome,
            detail: detail.into(),
            response_code: None,
        }
    }

    /// A failed test, or a skipped one if the TPM does not implement the
    /// algorithm the test needs.
    fn failed(name: &str, error: &WorkflowError) -> Self {
        let response_code = error.response_code();
        let outcome = if response_code.is_some_and(is_unsupported_algorithm) {
            TestOutcome::Skipped
        } else {
            TestOutcome::Failed
        };
        Self {
            response_code,
            ..Self::new(name, outcome, error_chain(error))
        }
    }
}

fn is_unsupported_algorithm(response_code: u32) -> bool {
    matches!(
        DecodedResponseCode::new(response_code).base,
        Some(
            ResponseCode::Asymmetric
                | ResponseCode::Hash
                | ResponseCode::KeySize
                | ResponseCode::Kdf
                | ResponseCode::Scheme
                | ResponseCode::Symmetric
                | ResponseCode::Curve
        )
    )
}

/// Formats an error with all of its sources on one line.
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

/// A built-in test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestCase {
    /// `TPM2_Startup(CLEAR)`
    Startup,
    /// Full `TPM2_SelfTest`.
    SelfTest,
    /// `TPM2_GetRandom`
    GetRandom,
    /// `TPM2_PCR_Read` of the profile bank.
    PcrRead,
    /// `TPM2_GetCapability` of the fixed properties.
    GetCapability,
    /// `TPM2_Hash` checked against a known digest.
    Hash,
    /// NV define, write, read and compare.
    NvStorage,
    /// Primary, child, load, sign and flush.
    KeyHierarchy,
    /// Signing directly with a primary key.
    PrimarySign,
    /// Sends a captured hex dump.
    Replay {
        /// Report name.
        label: String,
        /// Command as hex text.
        dump: String,
    },
}

impl TestCase {
    /// Name used by `--only` and in reports.
    pub fn name(&self) -> &str {
        match self {
            TestCase::Startup => "startup",
            TestCase::SelfTest => "self_test",
            TestCase::GetRandom => "get_random",
            TestCase::PcrRead => "pcr_read",
            TestCase::GetCapability => "get_capability",
            TestCase::Hash => "hash",
            TestCase::NvStorage => "nv_storage",
            TestCase::KeyHierarchy => "key_hierarchy",
            TestCase::PrimarySign => "primary_sign",
            TestCase::Replay { label, .. } => label.as_str(),
        }
    }

    /// Runs the test and reports the outcome. Never panics on TPM errors.
    pub fn run<E: TpmEngine>(
        &self,
        ctx: &mut TestContext<E>,
        profile: &AlgorithmProfile,
    ) -> TestReport {
        let name = self.name();
        match self {
            TestCase::Startup => run_startup(ctx, name),
            TestCase::SelfTest => match ctx.self_test(true) {
                Ok(()) => TestReport::new(name, TestOutcome::Passed, "full self test passed"),
                Err(error) => TestReport::failed(
                    name,
                    &WorkflowError::command(CommandCodeEnum::SelfTest)(error),
                ),
            },
            TestCase::GetRandom => run_get_random(ctx, name),
            TestCase::PcrRead => run_pcr_read(ctx, name, profile),
            TestCase::GetCapability => run_get_capability(ctx, name),
            TestCase::Hash => run_hash(ctx, name, profile),
            TestCase::NvStorage => run_nv_storage(ctx, name, profile),
            TestCase::KeyHierarchy => hierarchy_report(
                name,
                KeyHierarchy::run(ctx, *profile, profile.expected_test_digest()),
            ),
            TestCase::PrimarySign => hierarchy_report(
                name,
                run_primary_sign(ctx, *profile, profile.expected_test_digest()),
            ),
            TestCase::Replay { dump, .. } => run_replay(ctx, name, dump),
        }
    }
}

fn run_startup<E: TpmEngine>(ctx: &mut TestContext<E>, name: &str) -> TestReport {
    match ctx.startup(StartupType::Clear) {
        Ok(()) => TestReport::new(name, TestOutcome::Passed, "TPM started"),
        // The resource manager has usually started the TPM already.
        Err(error) if error.response_code() == Some(ResponseCode::Initialize as u32) => {
            TestReport {
                response_code: error.response_code(),
                ..TestReport::new(name, TestOutcome::Warning, "TPM already initialized")
            }
        }
        Err(error) => TestReport::failed(
            name,
            &WorkflowError::command(CommandCodeEnum::Startup)(error),
        ),
    }
}

fn run_get_random<E: TpmEngine>(ctx: &mut TestContext<E>, name: &str) -> TestReport {
    let random = match ctx.get_random(RANDOM_BYTES) {
        Ok(random) => random,
        Err(error) => {
            return TestReport::failed(
                name,
                &WorkflowError::command(CommandCodeEnum::GetRandom)(error),
            );
        }
    };

    if random.is_empty() {
        tracing::warn!("GetRandom returned no bytes");
        return TestReport::new(name, TestOutcome::Warning, "no random bytes returned");
    }
    if random.iter().all(|&b| b == 0) {
        tracing::warn!(len = random.len(), "GetRandom returned all zero bytes");
        return TestReport::new(
            name,
            TestOutcome::Warning,
            format!("{} random bytes are all zero", random.len()),
        );
    }

    let outcome = if random.len() < usize::from(RANDOM_BYTES) {
        TestOutcome::Warning
    } else {
        TestOutcome::Passed
    };
    TestReport::new(
        name,
        outcome,
        format!("{} random bytes: {:02x?}", random.len(), random),
    )
}

fn run_pcr_read<E: TpmEngine>(
    ctx: &mut TestContext<E>,
    name: &str,
    profile: &AlgorithmProfile,
) -> TestReport {
    let selection = PcrSelection::single(profile.hash, 0, PCR_SELECT_SIZE);
    let pcr = match ctx.pcr_read(&[selection]) {
        Ok(pcr) => pcr,
        Err(error) => {
            return TestReport::failed(
                name,
                &WorkflowError::command(CommandCodeEnum::PCR_Read)(error),
            );
        }
    };

    if pcr.truncated {
        return TestReport::new(
            name,
            TestOutcome::Warning,
            format!(
                "reply truncated after {} of {} digests",
                pcr.digests.len(),
                pcr.declared_digests
            ),
        );
    }

    let Some(digest) = pcr.digests.first() else {
        return TestReport::new(
            name,
            TestOutcome::Warning,
            format!("no {} bank digest for PCR 0", profile.name),
        );
    };

    if digest.len() != profile.digest_size() {
        return TestReport::new(
            name,
            TestOutcome::Failed,
            format!(
                "PCR 0 digest is {} bytes, expected {}",
                digest.len(),
                profile.digest_size()
            ),
        );
    }

    TestReport::new(
        name,
        TestOutcome::Passed,
        format!(
            "update counter {}, PCR 0 = {:02x?}",
            pcr.update_counter, digest
        ),
    )
}

fn run_get_capability<E: TpmEngine>(ctx: &mut TestContext<E>, name: &str) -> TestReport {
    let cap = match ctx.get_capability(TPM20_CAP_TPM_PROPERTIES, TPM20_PT_FIXED, 1) {
        Ok(cap) => cap,
        Err(error) => {
            return TestReport::failed(
                name,
                &WorkflowError::command(CommandCodeEnum::GetCapability)(error),
            );
        }
    };

    match &cap.data {
        CapabilityData::Properties(properties) if !properties.is_empty() => {
            let outcome = if cap.truncated {
                TestOutcome::Warning
            } else {
                TestOutcome::Passed
            };
            let detail = properties
                .iter()
                .map(|p| format!("{:#x} = {:#010x}", p.property, p.value))
                .collect::<Vec<_>>()
                .join(", ");
            TestReport::new(name, outcome, detail)
        }
        _ => TestReport::new(
            name,
            TestOutcome::Warning,
            format!(
                "no fixed properties returned ({} declared)",
                cap.declared_count
            ),
        ),
    }
}

fn run_hash<E: TpmEngine>(
    ctx: &mut TestContext<E>,
    name: &str,
    profile: &AlgorithmProfile,
) -> TestReport {
    let hash = match ctx.hash(HASH_TEST_MESSAGE, profile.hash, TPM20_RH_OWNER) {
        Ok(hash) => hash,
        Err(error) => {
            return TestReport::failed(
                name,
                &WorkflowError::command(CommandCodeEnum::Hash)(error),
            );
        }
    };

    let expected = profile.expected_test_digest();
    if hash.digest != expected {
        let error = WorkflowError::VerificationMismatch {
            what: "hash digest",
            expected: format!("{:02x?}", expected),
            actual: format!("{:02x?}", hash.digest),
        };
        tracing::error!(err = &error as &dyn std::error::Error, "hash check failed");
        return TestReport::failed(name, &error);
    }

    TestReport::new(
        name,
        TestOutcome::Passed,
        format!("{:?} digest matches", profile.hash),
    )
}

fn run_nv_storage<E: TpmEngine>(
    ctx: &mut TestContext<E>,
    name: &str,
    profile: &AlgorithmProfile,
) -> TestReport {
    let descriptor = NvIndexDescriptor::test_index(profile);
    let mut nv = NvWorkflow::new(descriptor);
    match nv.run(ctx, TPM_NV_TEST_DATA) {
        Ok(DefineOutcome::Created) => TestReport::new(
            name,
            TestOutcome::Passed,
            format!("defined, wrote and read back index {:#x}", descriptor.index),
        ),
        Ok(DefineOutcome::AlreadyDefined) => TestReport::new(
            name,
            TestOutcome::Passed,
            format!(
                "index {:#x} already defined; wrote and read back",
                descriptor.index
            ),
        ),
        Err(error) => {
            tracing::error!(
                err = &error as &dyn std::error::Error,
                state = ?nv.state(),
                "nv storage workflow failed"
            );
            TestReport::failed(name, &error)
        }
    }
}

fn hierarchy_report(name: &str, report: KeyHierarchyReport) -> TestReport {
    if let Some(error) = &report.error {
        return TestReport::failed(name, error);
    }

    let Some(signature) = &report.signature else {
        return TestReport::new(name, TestOutcome::Failed, "no signature produced");
    };

    let detail = format!(
        "signature algorithm {:#06x}, {} bytes",
        signature.sig_alg(),
        signature.len()
    );
    if report.flush_failures.is_empty() {
        TestReport::new(name, TestOutcome::Passed, detail)
    } else {
        let handles = report
            .flush_failures
            .iter()
            .map(|f| format!("{:#x}", f.handle))
            .collect::<Vec<_>>()
            .join(", ");
        TestReport::new(
            name,
            TestOutcome::Warning,
            format!("{detail}; failed to flush {handles}"),
        )
    }
}

fn run_replay<E: TpmEngine>(ctx: &mut TestContext<E>, name: &str, dump: &str) -> TestReport {
    match replay_hex(ctx, dump) {
        Ok(outcome) => {
            let rc = outcome.reply.response_code;
            let mut detail = format!(
                "{:?} -> {} ({} byte reply)",
                outcome.command_code,
                rc,
                outcome.reply.bytes.len()
            );
            if let Some(declared) = outcome.size_mismatch {
                detail.push_str(&format!(
                    "; size field {declared} != {} bytes sent",
                    outcome.command.len()
                ));
            }

            if outcome.succeeded() && outcome.size_mismatch.is_none() {
                TestReport::new(name, TestOutcome::Passed, detail)
            } else {
                TestReport {
                    response_code: Some(rc.raw),
                    ..TestReport::new(name, TestOutcome::Warning, detail)
                }
            }
        }
        Err(error) => {
            tracing::error!(err = &error as &dyn std::error::Error, "replay failed");
            TestReport::new(name, TestOutcome::Failed, error_chain(&error))
        }
    }
}

/// A test name that matched nothing in the registry.
#[derive(Error, Debug)]
#[error("unknown test '{0}'")]
pub struct UnknownTest(pub String);

/// Ordered list of tests sharing one profile.
#[derive(Debug, Clone)]
pub struct TestRegistry {
    profile: AlgorithmProfile,
    cases: Vec<TestCase>,
    pace: Duration,
}

impl TestRegistry {
    /// An empty registry.
    pub fn new(profile: AlgorithmProfile) -> Self {
        Self {
            profile,
            cases: Vec::new(),
            pace: Duration::ZERO,
        }
    }

    /// Every built-in test, in dependency-friendly order.
    pub fn standard(profile: AlgorithmProfile) -> Self {
        let mut registry = Self::new(profile);
        registry.cases = vec![
            TestCase::Startup,
            TestCase::SelfTest,
            TestCase::GetRandom,
            TestCase::PcrRead,
            TestCase::GetCapability,
            TestCase::Hash,
            TestCase::NvStorage,
            TestCase::KeyHierarchy,
            TestCase::PrimarySign,
            TestCase::Replay {
                label: "replay".into(),
                dump: REPLAY_GET_RANDOM.into(),
            },
        ];
        registry
    }

    /// Delay between consecutive tests.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// The profile every test runs with.
    pub fn profile(&self) -> &AlgorithmProfile {
        &self.profile
    }

    /// Appends a test.
    pub fn push(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    /// Test names, in run order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|case| case.name())
    }

    /// Keeps only the named tests, in registry order.
    pub fn retain_named<S: AsRef<str>>(&mut self, names: &[S]) -> Result<(), UnknownTest> {
        if let Some(unknown) = names
            .iter()
            .map(|n| n.as_ref())
            .find(|n| !self.names().any(|name| name == *n))
        {
            return Err(UnknownTest(unknown.to_owned()));
        }

        self.cases
            .retain(|case| names.iter().any(|n| n.as_ref() == case.name()));
        Ok(())
    }

    /// Runs every test in order. A failure never stops the run.
    pub fn run<E: TpmEngine>(&self, ctx: &mut TestContext<E>) -> RunSummary {
        let mut reports = Vec::with_capacity(self.cases.len());
        for (i, case) in self.cases.iter().enumerate() {
            if i > 0 && !self.pace.is_zero() {
                std::thread::sleep(self.pace);
            }

            tracing::debug!(test = case.name(), profile = self.profile.name, "running test");
            let report = case.run(ctx, &self.profile);
            tracing::info!(
                test = %report.name,
                outcome = %report.outcome,
                "{}",
                report.detail
            );
            reports.push(report);
        }

        RunSummary { reports }
    }
}

/// Reports of one registry run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// One report per test, in run order.
    pub reports: Vec<TestReport>,
}

impl RunSummary {
    /// Number of reports with `outcome`.
    pub fn count(&self, outcome: TestOutcome) -> usize {
        self.reports.iter().filter(|r| r.outcome == outcome).count()
    }

    /// Whether any test failed.
    pub fn any_failed(&self) -> bool {
        self.count(TestOutcome::Failed) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_tpm::MockTpm;

    #[test]
    fn test_standard_run_passes() {
        for profile in AlgorithmProfile::ALL {
            let mut ctx = TestContext::new(MockTpm::new());
            let summary = TestRegistry::standard(profile).run(&mut ctx);
            for report in &summary.reports {
                assert_eq!(
                    report.outcome,
                    TestOutcome::Passed,
                    "{} {}: {}",
                    profile,
                    report.name,
                    report.detail
                );
            }
            assert_eq!(summary.reports.len(), 10);
            assert_eq!(ctx.engine().live_objects(), 0);
        }
    }

    #[test]
    fn test_failure_is_local() {
        let mut ctx = TestContext::new(MockTpm::new());
        ctx.engine_mut()
            .fail_command(CommandCodeEnum::CreatePrimary, ResponseCode::Hierarchy as u32);
        let summary = TestRegistry::standard(AlgorithmProfile::default()).run(&mut ctx);

        let failed: Vec<_> = summary
            .reports
            .iter()
            .filter(|r| r.outcome == TestOutcome::Failed)
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(failed, vec!["key_hierarchy", "primary_sign"]);
        assert_eq!(summary.count(TestOutcome::Passed), 8);
        assert!(summary.any_failed());
        assert_eq!(
            summary.reports[7].response_code,
            Some(ResponseCode::Hierarchy as u32)
        );
    }

    #[test]
    fn test_startup_already_initialized_warns() {
        let mut ctx = TestContext::new(MockTpm::new());
        ctx.engine_mut()
            .fail_command(CommandCodeEnum::Startup, ResponseCode::Initialize as u32);
        let report = TestCase::Startup.run(&mut ctx, &AlgorithmProfile::default());
        assert_eq!(report.outcome, TestOutcome::Warning);
        assert_eq!(report.response_code, Some(0x100));
    }

    #[test]
    fn test_rejected_self_test_names_command() {
        let mut ctx = TestContext::new(MockTpm::new());
        ctx.engine_mut()
            .fail_command(CommandCodeEnum::SelfTest, ResponseCode::Failure as u32);
        let report = TestCase::SelfTest.run(&mut ctx, &AlgorithmProfile::default());
        assert_eq!(report.outcome, TestOutcome::Failed);
        assert_eq!(report.response_code, Some(0x101));
        assert!(
            report
                .detail
                .starts_with("TPM command error - command code: SelfTest"),
            "{}",
            report.detail
        );
    }

    #[test]
    fn test_zero_random_warns() {
        let mut ctx = TestContext::new(MockTpm::new());
        ctx.engine_mut().zero_random();
        let report = TestCase::GetRandom.run(&mut ctx, &AlgorithmProfile::default());
        assert_eq!(report.outcome, TestOutcome::Warning);
    }

    #[test]
    fn test_hash_mismatch_fails() {
        let mut ctx = TestContext::new(MockTpm::new());
        let mut profile = AlgorithmProfile::SHA256_RSA;
        profile.hash = tpm_protocol::AlgIdEnum::SHA384;
        let report = TestCase::Hash.run(&mut ctx, &profile);
        assert_eq!(report.outcome, TestOutcome::Failed);
        assert!(report.detail.starts_with("hash digest mismatch"));
        assert_eq!(report.response_code, None);
    }

    #[test]
    fn test_unsupported_curve_skips() {
        let mut ctx = TestContext::new(MockTpm::new());
        // TPM_RC_CURVE + TPM_RC_P + TPM_RC_2, rejecting inPublic.
        ctx.engine_mut()
            .fail_command(CommandCodeEnum::CreatePrimary, 0x2e6);
        let report = TestCase::KeyHierarchy.run(&mut ctx, &AlgorithmProfile::SM3_SM2);
        assert_eq!(report.outcome, TestOutcome::Skipped);
        assert_eq!(report.response_code, Some(0x2e6));
    }

    #[test]
    fn test_retain_named() {
        let mut registry = TestRegistry::standard(AlgorithmProfile::default());
        registry.retain_named(&["hash", "startup"]).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["startup", "hash"]);
        assert!(registry.retain_named(&["bogus"]).is_err());
    }

    #[test]
    fn test_replay_case() {
        let mut ctx = TestContext::new(MockTpm::new());
        let mut registry = TestRegistry::new(AlgorithmProfile::default());
        registry.push(TestCase::Replay {
            label: "flush".into(),
            dump: "80 01 00 00 00 0e 00 00 01 65 80 00 00 01".into(),
        });
        let summary = registry.run(&mut ctx);
        assert_eq!(summary.reports[0].name, "flush");
        assert_eq!(summary.reports[0].outcome, TestOutcome::Warning);
        assert_eq!(summary.reports[0].response_code, Some(0x18b));
    }
}
