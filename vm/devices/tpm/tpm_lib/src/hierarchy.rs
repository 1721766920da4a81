// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Key hierarchy workflow: CreatePrimary, Create, Load, Sign and FlushContext.
//!
//! Each step checks that the state left by the previous step is present
//! before anything is sent, so a failed step never leads to a command built
//! around a missing handle. Flushing is best-effort and releases whatever
//! objects the workflow still holds.

use crate::TestContext;
use crate::TpmCommandError;
use crate::TpmEngine;
use crate::WorkflowError;
use crate::profile::AlgorithmProfile;
use std::num::NonZeroU32;
use tpm_protocol::response::Signature;
use tpm_protocol::tpm20proto::CommandCodeEnum;
use tpm_protocol::tpm20proto::TPM20_RH_OWNER;

/// A transient object handle returned by the TPM. Never zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ObjectHandle(NonZeroU32);

impl ObjectHandle {
    fn new(handle: u32, command_code: CommandCodeEnum) -> Result<Self, WorkflowError> {
        NonZeroU32::new(handle)
            .map(Self)
            .ok_or(WorkflowError::InvalidHandle(command_code))
    }

    /// The raw handle value.
    pub fn get(&self) -> u32 {
        self.0.get()
    }

    /// An object the TPM created even though the command's reply was invalid.
    fn created_by(error: &TpmCommandError) -> Option<Self> {
        error.object_handle().and_then(NonZeroU32::new).map(Self)
    }
}

/// Private and public blobs produced by Create, consumed by Load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlobs {
    /// `TPM2B_PRIVATE` contents.
    pub private: Vec<u8>,
    /// `TPM2B_PUBLIC` contents.
    pub public: Vec<u8>,
}

/// Progress of a [`KeyHierarchy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyHierarchyState {
    /// Nothing created yet.
    Idle,
    /// The storage primary is loaded.
    PrimaryCreated {
        /// Storage primary.
        primary: ObjectHandle,
    },
    /// The child has been created but not loaded.
    ChildBlobReady {
        /// Storage primary.
        primary: ObjectHandle,
        /// Blobs returned by Create.
        blobs: KeyBlobs,
    },
    /// The child is loaded and can sign.
    ChildLoaded {
        /// Storage primary.
        primary: ObjectHandle,
        /// Loaded signing key.
        child: ObjectHandle,
    },
    /// A signature was produced.
    Signed {
        /// Storage primary.
        primary: ObjectHandle,
        /// Loaded signing key.
        child: ObjectHandle,
    },
    /// Every held object has been released.
    Flushed,
}

impl KeyHierarchyState {
    fn primary(&self) -> Option<ObjectHandle> {
        match self {
            KeyHierarchyState::PrimaryCreated { primary }
            | KeyHierarchyState::ChildBlobReady { primary, .. }
            | KeyHierarchyState::ChildLoaded { primary, .. }
            | KeyHierarchyState::Signed { primary, .. } => Some(*primary),
            KeyHierarchyState::Idle | KeyHierarchyState::Flushed => None,
        }
    }

    fn child(&self) -> Option<ObjectHandle> {
        match self {
            KeyHierarchyState::ChildLoaded { child, .. }
            | KeyHierarchyState::Signed { child, .. } => Some(*child),
            _ => None,
        }
    }
}

/// A flush that the TPM rejected or that could not be sent.
#[derive(Debug)]
pub struct FlushFailure {
    /// The handle that is still loaded.
    pub handle: u32,
    /// Why the flush failed.
    pub error: TpmCommandError,
}

/// Outcome of a complete key hierarchy run.
#[derive(Debug, Default)]
pub struct KeyHierarchyReport {
    /// Handle of the primary, once created.
    pub primary: Option<u32>,
    /// Handle of the loaded child, once loaded.
    pub child: Option<u32>,
    /// The signature, if signing succeeded.
    pub signature: Option<Signature>,
    /// The step that ended the run early.
    pub error: Option<WorkflowError>,
    /// Flushes that did not go through.
    pub flush_failures: Vec<FlushFailure>,
}

impl KeyHierarchyReport {
    /// Whether the run produced a signature without errors.
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.signature.is_some()
    }
}

/// Storage primary key with one signing child.
pub struct KeyHierarchy {
    profile: AlgorithmProfile,
    state: KeyHierarchyState,
}

impl KeyHierarchy {
    /// A hierarchy in the `Idle` state.
    pub fn new(profile: AlgorithmProfile) -> Self {
        Self {
            profile,
            state: KeyHierarchyState::Idle,
        }
    }

    /// Where the workflow stands.
    pub fn state(&self) -> &KeyHierarchyState {
        &self.state
    }

    /// Creates the storage primary under the owner hierarchy.
    pub fn create_primary<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
    ) -> Result<ObjectHandle, WorkflowError> {
        if self.state != KeyHierarchyState::Idle {
            return Err(WorkflowError::MissingDependency {
                step: "CreatePrimary",
                requires: "an idle hierarchy",
            });
        }

        let reply = ctx
            .create_primary(TPM20_RH_OWNER, &self.profile.storage_template())
            .map_err(|error| {
                if let Some(primary) = ObjectHandle::created_by(&error) {
                    self.state = KeyHierarchyState::PrimaryCreated { primary };
                }
                WorkflowError::command(CommandCodeEnum::CreatePrimary)(error)
            })?;
        let primary = ObjectHandle::new(reply.object_handle, CommandCodeEnum::CreatePrimary)?;

        tracing::debug!(handle = primary.get(), "created storage primary");
        self.state = KeyHierarchyState::PrimaryCreated { primary };
        Ok(primary)
    }

    /// Creates the signing child under the primary and keeps its blobs.
    pub fn create_child<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
    ) -> Result<(), WorkflowError> {
        let KeyHierarchyState::PrimaryCreated { primary } = self.state else {
            return Err(WorkflowError::MissingDependency {
                step: "Create",
                requires: "a primary key handle",
            });
        };

        let reply = ctx
            .create(primary.get(), &self.profile.signing_template())
            .map_err(WorkflowError::command(CommandCodeEnum::Create))?;

        self.state = KeyHierarchyState::ChildBlobReady {
            primary,
            blobs: KeyBlobs {
                private: reply.out_private,
                public: reply.out_public,
            },
        };
        Ok(())
    }

    /// Loads the child blobs under the primary. The blobs are released once
    /// loaded.
    pub fn load_child<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
    ) -> Result<ObjectHandle, WorkflowError> {
        let KeyHierarchyState::ChildBlobReady { primary, blobs } = &self.state else {
            return Err(WorkflowError::MissingDependency {
                step: "Load",
                requires: "created key blobs",
            });
        };
        let primary = *primary;

        let reply = match ctx.load(primary.get(), &blobs.private, &blobs.public) {
            Ok(reply) => reply,
            Err(error) => {
                if let Some(child) = ObjectHandle::created_by(&error) {
                    self.state = KeyHierarchyState::ChildLoaded { primary, child };
                }
                return Err(WorkflowError::command(CommandCodeEnum::Load)(error));
            }
        };
        let child = ObjectHandle::new(reply.object_handle, CommandCodeEnum::Load)?;

        tracing::debug!(handle = child.get(), "loaded signing key");
        self.state = KeyHierarchyState::ChildLoaded { primary, child };
        Ok(child)
    }

    /// Signs `digest` with the loaded child.
    pub fn sign<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
        digest: &[u8],
    ) -> Result<Signature, WorkflowError> {
        let KeyHierarchyState::ChildLoaded { primary, child } = self.state else {
            return Err(WorkflowError::MissingDependency {
                step: "Sign",
                requires: "a loaded signing key",
            });
        };

        let signature = ctx
            .sign(child.get(), digest)
            .map_err(WorkflowError::command(CommandCodeEnum::Sign))?;

        self.state = KeyHierarchyState::Signed { primary, child };
        Ok(signature)
    }

    /// Flushes the child and then the primary, whichever are held. Failures
    /// are logged and returned, never retried.
    pub fn flush<E: TpmEngine>(&mut self, ctx: &mut TestContext<E>) -> Vec<FlushFailure> {
        let handles = [self.state.child(), self.state.primary()];
        self.state = KeyHierarchyState::Flushed;

        handles
            .into_iter()
            .flatten()
            .filter_map(|handle| flush_handle(ctx, handle.get()))
            .collect()
    }

    fn run_steps<E: TpmEngine>(
        &mut self,
        ctx: &mut TestContext<E>,
        digest: &[u8],
        report: &mut KeyHierarchyReport,
    ) -> Result<Signature, WorkflowError> {
        report.primary = Some(self.create_primary(ctx)?.get());
        self.create_child(ctx)?;
        report.child = Some(self.load_child(ctx)?.get());
        self.sign(ctx, digest)
    }

    /// Runs the whole workflow, flushing whatever was created on every path.
    pub fn run<E: TpmEngine>(
        ctx: &mut TestContext<E>,
        profile: AlgorithmProfile,
        digest: &[u8],
    ) -> KeyHierarchyReport {
        let mut workflow = Self::new(profile);
        let mut report = KeyHierarchyReport::default();

        match workflow.run_steps(ctx, digest, &mut report) {
            Ok(signature) => report.signature = Some(signature),
            Err(error) => {
                tracing::error!(
                    err = &error as &dyn std::error::Error,
                    profile = profile.name,
                    "key hierarchy workflow failed"
                );
                report.error = Some(error);
            }
        }

        report.primary = report.primary.or(workflow.state.primary().map(|h| h.get()));
        report.child = report.child.or(workflow.state.child().map(|h| h.get()));
        report.flush_failures = workflow.flush(ctx);
        report
    }
}

fn flush_handle<E: TpmEngine>(ctx: &mut TestContext<E>, handle: u32) -> Option<FlushFailure> {
    match ctx.flush_context(handle) {
        Ok(()) => None,
        Err(error) => {
            tracing::warn!(
                err = &error as &dyn std::error::Error,
                handle,
                "failed to flush TPM object"
            );
            Some(FlushFailure { handle, error })
        }
    }
}

/// Creates a signing key directly under the owner hierarchy, signs `digest`
/// with it and flushes it.
pub fn run_primary_sign<E: TpmEngine>(
    ctx: &mut TestContext<E>,
    profile: AlgorithmProfile,
    digest: &[u8],
) -> KeyHierarchyReport {
    let mut report = KeyHierarchyReport::default();

    let mut created = None;
    let primary = ctx
        .create_primary(TPM20_RH_OWNER, &profile.signing_template())
        .map_err(|error| {
            created = ObjectHandle::created_by(&error);
            WorkflowError::command(CommandCodeEnum::CreatePrimary)(error)
        })
        .and_then(|reply| ObjectHandle::new(reply.object_handle, CommandCodeEnum::CreatePrimary));

    let primary = match primary {
        Ok(primary) => primary,
        Err(error) => {
            tracing::error!(
                err = &error as &dyn std::error::Error,
                profile = profile.name,
                "failed to create signing primary"
            );
            report.error = Some(error);
            if let Some(primary) = created {
                report.primary = Some(primary.get());
                report.flush_failures.extend(flush_handle(ctx, primary.get()));
            }
            return report;
        }
    };
    report.primary = Some(primary.get());

    match ctx.sign(primary.get(), digest) {
        Ok(signature) => report.signature = Some(signature),
        Err(error) => {
            let error = WorkflowError::command(CommandCodeEnum::Sign)(error);
            tracing::error!(
                err = &error as &dyn std::error::Error,
                "signing with primary key failed"
            );
            report.error = Some(error);
        }
    }

    report.flush_failures.extend(flush_handle(ctx, primary.get()));
    report
}
