//! Upload graph construction.
//!
//! [`template`] is the strategy table: a pure mapping from graph state and
//! policy to the stages left to run. [`UploadGraphBuilder`] turns a
//! template into scheduled tasks and a progress tree.

use std::sync::Arc;

use nimbus_transfer::{Progress, Task, TaskHandle, TaskId, TaskScheduler};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;
use crate::upload::draft::UploadDraft;
use crate::upload::stages::{self, StageContext};
use crate::upload::state::GraphState;

/// How the remote models drafts and commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphPolicy {
    /// Draft creation happens inside the upload stage; a single seal step
    /// commits after upload.
    #[default]
    DirectCommit,
    /// Draft creation and commit are separate stages.
    SplitDraftCommit,
    /// Single-revision content class: new revisions are rejected.
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Encrypt,
    CreateDraft,
    UploadContent,
    Seal,
    Commit,
}

impl StageKind {
    /// Progress units per content unit.
    pub fn weight(self) -> u64 {
        match self {
            Self::UploadContent => 2,
            Self::Encrypt | Self::CreateDraft | Self::Seal | Self::Commit => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStep {
    /// Completed by an earlier attempt; only its progress weight remains.
    AlreadyDone(StageKind),
    Run(StageKind),
}

impl StageStep {
    pub fn kind(self) -> StageKind {
        match self {
            Self::AlreadyDone(kind) | Self::Run(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphTemplate {
    pub steps: Vec<StageStep>,
    /// The upload stage creates the remote draft before requesting links.
    pub draft_in_upload: bool,
}

impl GraphTemplate {
    pub fn total_weight(&self, content_units: u64) -> u64 {
        self.steps
            .iter()
            .map(|s| s.kind().weight() * content_units)
            .sum()
    }

    pub fn remaining(&self) -> Vec<StageKind> {
        self.steps
            .iter()
            .filter_map(|s| match s {
                StageStep::Run(kind) => Some(*kind),
                StageStep::AlreadyDone(_) => None,
            })
            .collect()
    }
}

const SPLIT_STAGES: [StageKind; 4] = [
    StageKind::Encrypt,
    StageKind::CreateDraft,
    StageKind::UploadContent,
    StageKind::Commit,
];

const DIRECT_STAGES: [StageKind; 3] = [
    StageKind::Encrypt,
    StageKind::UploadContent,
    StageKind::Seal,
];

/// Stages left to run for `state` under `policy`.
pub fn template(state: GraphState, policy: GraphPolicy) -> Result<GraphTemplate, SyncError> {
    if policy == GraphPolicy::Restricted && state.is_new_revision() {
        return Err(SyncError::InvalidStateForClass(format!(
            "{state:?}: content class allows a single revision"
        )));
    }

    let split = policy == GraphPolicy::SplitDraftCommit;
    let first = match state {
        GraphState::EncryptingRevision | GraphState::EncryptingNewRevision => StageKind::Encrypt,
        GraphState::CreatingFileDraft | GraphState::CreatingNewRevision if split => {
            StageKind::CreateDraft
        }
        GraphState::CreatingFileDraft
        | GraphState::CreatingNewRevision
        | GraphState::UploadingRevision => StageKind::UploadContent,
        GraphState::CommitingRevision if split => StageKind::Commit,
        GraphState::CommitingRevision => StageKind::Seal,
        GraphState::None => {
            return Err(SyncError::InvalidState("no resumption point".into()));
        }
    };

    let stages: &[StageKind] = if split { &SPLIT_STAGES } else { &DIRECT_STAGES };
    let start = stages.iter().position(|s| *s == first).unwrap_or(0);
    let steps = stages
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            if i < start {
                StageStep::AlreadyDone(*kind)
            } else {
                StageStep::Run(*kind)
            }
        })
        .collect();

    Ok(GraphTemplate {
        steps,
        draft_in_upload: !split,
    })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Scheduled tasks of one upload attempt.
pub struct UploadGraph {
    /// Every other task of the graph depends on this one, so cancelling
    /// it cancels whatever has not finished.
    pub first: TaskId,
    /// Completes last; its outcome is the outcome of the attempt.
    pub root: TaskHandle<SyncError>,
    pub progress: Progress,
    pub tasks: Vec<TaskId>,
}

pub struct UploadGraphBuilder<'a> {
    scheduler: &'a TaskScheduler<SyncError>,
    ctx: &'a StageContext,
    policy: GraphPolicy,
}

impl<'a> UploadGraphBuilder<'a> {
    pub fn new(
        scheduler: &'a TaskScheduler<SyncError>,
        ctx: &'a StageContext,
        policy: GraphPolicy,
    ) -> Self {
        Self {
            scheduler,
            ctx,
            policy,
        }
    }

    /// Submits the remaining stages of `draft`.
    ///
    /// An unbuildable state yields a single task failing with the reason,
    /// so the caller always receives a terminal outcome.
    pub fn build(&self, draft: Arc<UploadDraft>) -> UploadGraph {
        let template = match template(draft.graph_state, self.policy) {
            Ok(template) => template,
            Err(e) => return self.failing(e),
        };

        let units = draft.content_units();
        let progress = Progress::new(template.total_weight(units));
        // Handles stay alive until the graph is complete so no stage is
        // reclaimed before its dependents are linked.
        let mut submitted: Vec<TaskHandle<SyncError>> = Vec::new();
        let mut prev: Vec<TaskId> = Vec::new();
        let mut last = None;

        for step in &template.steps {
            let kind = step.kind();
            let weight = kind.weight() * units;
            let handles = match step {
                StageStep::AlreadyDone(_) => {
                    // Counted before anything runs so a resumed attempt
                    // starts from the progress it had reached.
                    progress.child(0, weight).finish();
                    let task = Task::noop(format!("{kind:?} done")).with_weight(weight);
                    vec![self.scheduler.submit(task, &prev)]
                }
                StageStep::Run(kind) => self.submit_stage(
                    *kind,
                    &draft,
                    &progress,
                    weight,
                    template.draft_in_upload,
                    &prev,
                ),
            };
            prev = handles.iter().map(TaskHandle::id).collect();
            last = handles.last().cloned();
            submitted.extend(handles);
        }
        let tasks: Vec<TaskId> = submitted.iter().map(TaskHandle::id).collect();

        let (Some(first), Some(root)) = (tasks.first().copied(), last) else {
            return self.failing(SyncError::InvalidState("empty upload graph".into()));
        };
        debug!(
            node = %draft.node_id,
            state = ?draft.graph_state,
            stages = ?template.remaining(),
            tasks = tasks.len(),
            "upload graph built"
        );
        UploadGraph {
            first,
            root,
            progress,
            tasks,
        }
    }

    fn failing(&self, error: SyncError) -> UploadGraph {
        let task = Task::new("rejected", move |_| async move { Err(error) });
        let root = self.scheduler.submit(task, &[]);
        UploadGraph {
            first: root.id(),
            tasks: vec![root.id()],
            root,
            progress: Progress::new(0),
        }
    }

    fn submit_stage(
        &self,
        kind: StageKind,
        draft: &Arc<UploadDraft>,
        progress: &Progress,
        weight: u64,
        draft_in_upload: bool,
        deps: &[TaskId],
    ) -> Vec<TaskHandle<SyncError>> {
        let ctx = self.ctx.clone();
        let draft = Arc::clone(draft);
        let label = format!("{kind:?} {}", draft.node_id);
        let task: Task<SyncError> = match kind {
            StageKind::Encrypt => {
                let stage = progress.child(u64::from(draft.number_of_blocks), weight);
                Task::new(label, move |task| stages::encrypt(ctx, draft, stage, task))
            }
            StageKind::CreateDraft => {
                let stage = progress.child(1, weight);
                Task::new(label, move |task| async move {
                    stages::create_draft(&ctx, &draft, &task).await?;
                    stage.finish();
                    Ok(())
                })
            }
            StageKind::Seal | StageKind::Commit => {
                let stage = progress.child(1, weight);
                Task::new(label, move |task| stages::seal(ctx, draft, stage, task))
            }
            StageKind::UploadContent => {
                return self.submit_upload(&draft, progress, weight, draft_in_upload, deps);
            }
        };
        vec![self.scheduler.submit(task.with_weight(weight), deps)]
    }

    /// Link request followed by one task per pending block.
    fn submit_upload(
        &self,
        draft: &Arc<UploadDraft>,
        progress: &Progress,
        weight: u64,
        create_draft_first: bool,
        deps: &[TaskId],
    ) -> Vec<TaskHandle<SyncError>> {
        let stage = progress.child(u64::from(draft.number_of_blocks), weight);
        stage.advance(draft.uploaded_blocks.len() as u64);

        let links = {
            let ctx = self.ctx.clone();
            let draft = Arc::clone(draft);
            let stage = stage.clone();
            let empty = draft.number_of_blocks == 0;
            let label = format!("RequestLinks {}", draft.node_id);
            let task: Task<SyncError> = Task::new(label, move |task| async move {
                stages::request_links(ctx, draft, create_draft_first, task).await?;
                if empty {
                    stage.finish();
                }
                Ok(())
            });
            self.scheduler.submit(task.with_weight(weight), deps)
        };

        let blocks: Vec<_> = draft
            .pending_blocks
            .iter()
            .map(|&index| {
                let ctx = self.ctx.clone();
                let draft = Arc::clone(draft);
                let stage = stage.clone();
                let label = format!("UploadBlock {} #{index}", draft.node_id);
                let task = Task::new(label, move |task| {
                    stages::upload_block(ctx, draft, index, stage, task)
                })
                .fail_fast();
                self.scheduler.submit(task, &[links.id()])
            })
            .collect();

        if blocks.is_empty() {
            vec![links]
        } else {
            blocks
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::StageKind::*;

    fn kinds(t: &GraphTemplate) -> Vec<StageStep> {
        t.steps.clone()
    }

    #[test]
    fn direct_commit_from_scratch_runs_every_stage() {
        let t = template(GraphState::EncryptingRevision, GraphPolicy::DirectCommit).unwrap();
        assert_eq!(t.remaining(), vec![Encrypt, UploadContent, Seal]);
        assert!(t.draft_in_upload);
        assert_eq!(t.total_weight(5), 20);
    }

    #[test]
    fn split_policy_schedules_draft_creation_separately() {
        let t = template(GraphState::EncryptingNewRevision, GraphPolicy::SplitDraftCommit).unwrap();
        assert_eq!(t.remaining(), vec![Encrypt, CreateDraft, UploadContent, Commit]);
        assert!(!t.draft_in_upload);
        assert_eq!(t.total_weight(3), 15);
    }

    #[test]
    fn resumed_states_mark_earlier_stages_done() {
        let t = template(GraphState::UploadingRevision, GraphPolicy::DirectCommit).unwrap();
        assert_eq!(
            kinds(&t),
            vec![
                StageStep::AlreadyDone(Encrypt),
                StageStep::Run(UploadContent),
                StageStep::Run(Seal)
            ]
        );

        let t = template(GraphState::CreatingFileDraft, GraphPolicy::SplitDraftCommit).unwrap();
        assert_eq!(t.remaining(), vec![CreateDraft, UploadContent, Commit]);

        let t = template(GraphState::CreatingFileDraft, GraphPolicy::DirectCommit).unwrap();
        assert_eq!(t.remaining(), vec![UploadContent, Seal]);

        let t = template(GraphState::CommitingRevision, GraphPolicy::SplitDraftCommit).unwrap();
        assert_eq!(t.remaining(), vec![Commit]);
        // Done stages keep their weight.
        assert_eq!(t.total_weight(2), 10);
    }

    #[test]
    fn restricted_rejects_new_revisions() {
        for state in [GraphState::EncryptingNewRevision, GraphState::CreatingNewRevision] {
            assert!(matches!(
                template(state, GraphPolicy::Restricted),
                Err(SyncError::InvalidStateForClass(_))
            ));
        }
        let t = template(GraphState::EncryptingRevision, GraphPolicy::Restricted).unwrap();
        assert_eq!(t.remaining(), vec![Encrypt, UploadContent, Seal]);
    }

    #[test]
    fn none_state_has_no_template() {
        for policy in [
            GraphPolicy::DirectCommit,
            GraphPolicy::SplitDraftCommit,
            GraphPolicy::Restricted,
        ] {
            assert!(matches!(
                template(GraphState::None, policy),
                Err(SyncError::InvalidState(_))
            ));
        }
    }

    #[test]
    fn policy_serde_names() {
        assert_eq!(
            serde_json::to_string(&GraphPolicy::SplitDraftCommit).unwrap(),
            "\"split_draft_commit\""
        );
    }
}
