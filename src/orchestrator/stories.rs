//! The story loop.
//!
//! Drives Development → Review → Fix for each story produced by the
//! Analysis phase. Stories run strictly sequentially — later stories may
//! depend on earlier file changes — and each one starts from a workspace
//! checkpoint so a rejected story's changes can be discarded without
//! corrupting the stories already kept.

use std::sync::Arc;

use crate::events::TaskEvent;
use crate::external::{Checkpoint, RealtimeChannel, SourceControl};
use crate::orchestrator::{ExecutionContext, StoryCursor};
use crate::phase::{PhaseExecutor, PhaseRole};
use crate::pipeline::Pipeline;
use crate::story::{ReviewAssessment, Story, StoryResult, StoryStatus, Verdict};

pub(crate) async fn run_story_loop(
    executor: &PhaseExecutor,
    scm: &Arc<dyn SourceControl>,
    channel: &Arc<dyn RealtimeChannel>,
    pipeline: &Pipeline,
    ctx: &mut ExecutionContext,
) -> Vec<StoryResult> {
    // The caller guarantees a Development phase exists before entering.
    let development = Arc::clone(
        pipeline
            .find_role(PhaseRole::Development)
            .expect("story loop requires a Development phase"),
    );
    let judge = pipeline.find_role(PhaseRole::Review).cloned();
    let fixer = pipeline.find_role(PhaseRole::Fix).cloned();

    let stories = ctx.vars.stories.clone();
    let total = stories.len();
    let task_id = ctx.task.id.clone();
    let mut results = Vec::with_capacity(total);

    for (index, mut story) in stories.into_iter().enumerate() {
        if ctx.is_cancelled() {
            results.push(StoryResult::failed(&story, "Task cancelled"));
            break;
        }

        story.status = StoryStatus::InProgress;
        channel.to_task(
            &task_id,
            TaskEvent::StoryStarted {
                task_id: task_id.clone(),
                story_id: story.id.clone(),
                index,
                total,
            },
        );
        tracing::info!(task_id = %task_id, story = %story.title, index, total, "Story started");

        // Snapshot before touching the workspace; serialized with the
        // loop itself, so checkpoint operations never overlap.
        let checkpoint = take_checkpoint(scm, ctx).await;

        ctx.vars.current_story = Some(StoryCursor {
            story: story.clone(),
            index,
            total,
        });
        ctx.vars.review = None;

        // Development. A failure fails this story only; the loop moves on.
        let dev_result = executor.run(development.as_ref(), ctx).await;
        ctx.record_result(development.name(), dev_result.clone());
        if !dev_result.success {
            let error = dev_result
                .error
                .clone()
                .unwrap_or_else(|| "Development failed".to_string());
            story.status = StoryStatus::Failed;
            restore_checkpoint(scm, ctx, checkpoint).await;
            finish_story(channel, &task_id, &story, false);
            let mut result = StoryResult::failed(&story, &error);
            result.development = Some(dev_result);
            results.push(result);
            continue;
        }

        // Review.
        let mut assessment: Option<ReviewAssessment> = None;
        let mut review_result = None;
        if let Some(judge) = &judge {
            let result = executor.run(judge.as_ref(), ctx).await;
            ctx.record_result(judge.name(), result.clone());
            if !result.success {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "Review failed".to_string());
                story.status = StoryStatus::Failed;
                restore_checkpoint(scm, ctx, checkpoint).await;
                finish_story(channel, &task_id, &story, false);
                let mut story_result = StoryResult::failed(&story, &error);
                story_result.development = Some(dev_result);
                story_result.review = Some(result);
                results.push(story_result);
                continue;
            }
            match serde_json::from_value::<ReviewAssessment>(result.output.clone()) {
                Ok(parsed) => {
                    story.verdict = Some(parsed.verdict);
                    ctx.vars.review = Some(parsed.clone());
                    assessment = Some(parsed);
                }
                Err(e) => {
                    tracing::warn!(task_id = %task_id, story = %story.title, error = %e,
                        "Review result did not carry a parseable assessment");
                }
            }
            review_result = Some(result);
        }

        // Fix, when the verdict calls for it. A successful fix upgrades
        // the verdict to approved without a second review pass.
        let mut fix_result = None;
        if let (Some(found), Some(fixer)) = (&assessment, &fixer)
            && found.verdict != Verdict::Approved
            && !found.issues.is_empty()
        {
            if let Some(cursor) = &mut ctx.vars.current_story {
                cursor.story.verdict = story.verdict;
            }
            let result = executor.run(fixer.as_ref(), ctx).await;
            ctx.record_result(fixer.name(), result.clone());
            if result.success {
                story.verdict = Some(Verdict::Approved);
            }
            fix_result = Some(result);
        }

        // A story rejected outright loses its changes; anything else
        // keeps them for the stories that follow.
        if story.verdict == Some(Verdict::Rejected) {
            restore_checkpoint(scm, ctx, checkpoint).await;
        } else {
            discard_checkpoint(scm, checkpoint).await;
        }

        story.status = StoryStatus::Completed;
        finish_story(channel, &task_id, &story, true);
        results.push(StoryResult {
            story_id: story.id.clone(),
            title: story.title.clone(),
            success: true,
            final_verdict: story.verdict,
            assessment,
            development: Some(dev_result),
            review: review_result,
            fix: fix_result,
            error: None,
        });
    }

    ctx.vars.current_story = None;
    ctx.vars.review = None;
    results
}

async fn take_checkpoint(
    scm: &Arc<dyn SourceControl>,
    ctx: &ExecutionContext,
) -> Option<Checkpoint> {
    match scm.checkpoint(&ctx.workspace).await {
        Ok(checkpoint) => Some(checkpoint),
        Err(e) => {
            tracing::warn!(task_id = %ctx.task.id, error = %format!("{:#}", e),
                "Checkpoint failed; story will run without rollback");
            None
        }
    }
}

async fn restore_checkpoint(
    scm: &Arc<dyn SourceControl>,
    ctx: &ExecutionContext,
    checkpoint: Option<Checkpoint>,
) {
    let Some(checkpoint) = checkpoint else { return };
    if let Err(e) = scm.restore(&ctx.workspace, &checkpoint).await {
        tracing::warn!(task_id = %ctx.task.id, checkpoint = %checkpoint.id,
            error = %format!("{:#}", e), "Checkpoint restore failed");
    }
}

async fn discard_checkpoint(scm: &Arc<dyn SourceControl>, checkpoint: Option<Checkpoint>) {
    let Some(checkpoint) = checkpoint else { return };
    if let Err(e) = scm.discard(&checkpoint).await {
        tracing::warn!(checkpoint = %checkpoint.id, error = %format!("{:#}", e),
            "Checkpoint discard failed");
    }
}

fn finish_story(
    channel: &Arc<dyn RealtimeChannel>,
    task_id: &str,
    story: &Story,
    success: bool,
) {
    channel.to_task(
        task_id,
        TaskEvent::StoryCompleted {
            task_id: task_id.to_string(),
            story_id: story.id.clone(),
            success,
            verdict: story.verdict,
        },
    );
    tracing::info!(
        task_id,
        story = %story.title,
        success,
        verdict = story.verdict.map(|v| v.as_str()).unwrap_or("none"),
        "Story finished"
    );
}
