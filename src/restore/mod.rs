pub mod db_restore;
pub mod emergency;
pub mod logic;
pub mod prompt;
pub mod selection;
pub mod verification;

use chrono::NaiveDateTime;

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::storage::{Tier, render_listing};
use crate::toolkit::Toolkit;
use logic::{RestoreOrchestrator, RestoreOutcome, RestorePlan};
use prompt::Operator;
use selection::{Selection, Selector, resolve};

/// Whether archived configuration files are put back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChoice {
    Ask,
    Restore,
    Skip,
}

/// What the command line asked for, before any prompting.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// `None` lists every archive and asks the operator.
    pub selector: Option<Selector>,
    pub assume_yes: bool,
    pub config: ConfigChoice,
}

/// Resolves a request into a plan, prompting only for what is missing.
/// Returns `None` if the operator backs out while choosing.
pub async fn prepare_plan(
    tools: &Toolkit,
    request: &RestoreRequest,
    operator: &dyn Operator,
) -> Result<Option<RestorePlan>> {
    let archive = match &request.selector {
        Some(selector) => resolve(tools.store.as_ref(), selector)
            .await?
            .into_resolved(selector)?,
        None => {
            let all = tools.store.list_all().await?;
            if all.is_empty() {
                return Err(AppError::NotFound("any archive".to_string()));
            }
            println!("{}", render_listing(&all));
            let answer = operator.ask("Tier for its latest archive (daily/weekly/monthly) or a date (YYYYMMDD)")?;
            let selector = match answer.trim().parse::<Tier>() {
                Ok(tier) => Selector::Latest(tier),
                Err(_) => Selector::Date(answer.trim().to_string()),
            };
            match selection::select(&all, &selector)? {
                Selection::Resolved(archive) => archive,
                Selection::Ambiguous(candidates) => {
                    let names: Vec<String> = candidates.iter().map(|a| a.name.clone()).collect();
                    match operator.choose(&format!("'{}' matches several archives", answer.trim()), &names)? {
                        Some(index) => candidates[index].clone(),
                        None => return Ok(None),
                    }
                }
            }
        }
    };
    tracing::info!("Selected {}", archive.name);

    let confirmed = request.assume_yes
        || operator.confirm(
            &format!(
                "Restore {}? Live databases and file sets will be replaced",
                archive.name
            ),
            false,
        )?;
    let restore_config = confirmed
        && match request.config {
            ConfigChoice::Restore => true,
            ConfigChoice::Skip => false,
            ConfigChoice::Ask if request.assume_yes => false,
            ConfigChoice::Ask => operator.confirm("Also restore configuration files?", false)?,
        };

    Ok(Some(RestorePlan {
        archive,
        confirmed,
        restore_config,
    }))
}

/// Front end of a restore: selection and confirmation, then the orchestrator.
pub async fn run_restore_flow(
    config: &AppConfig,
    tools: &Toolkit,
    request: &RestoreRequest,
    operator: &dyn Operator,
    now: NaiveDateTime,
) -> Result<RestoreOutcome> {
    match prepare_plan(tools, request, operator).await? {
        Some(plan) => RestoreOrchestrator::new(config, tools).run(plan, now).await,
        None => Ok(RestoreOutcome::Declined),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedOperator, TestBed, at};

    fn request(selector: Option<Selector>) -> RestoreRequest {
        RestoreRequest {
            selector,
            assume_yes: false,
            config: ConfigChoice::Ask,
        }
    }

    #[tokio::test]
    async fn explicit_ambiguous_date_halts_with_both_candidates() {
        let bed = TestBed::new();
        let tools = bed.toolkit();
        bed.seed_remote(&[
            "backup-daily-20240115_020000.tar.gz",
            "backup-weekly-20240115_030000.tar.gz",
        ]);
        let operator = ScriptedOperator::default();

        let err = run_restore_flow(
            &bed.config,
            &tools,
            &request(Some(Selector::Date("20240115".into()))),
            &operator,
            at("20240120_100000"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "SelectionAmbiguous");
        let message = err.to_string();
        assert!(message.contains("backup-daily-20240115_020000.tar.gz"));
        assert!(message.contains("backup-weekly-20240115_030000.tar.gz"));
        assert!(!bed.config.emergency_dir().exists());
    }

    #[tokio::test]
    async fn single_date_match_needs_only_confirmation() {
        let bed = TestBed::new();
        let tools = bed.toolkit();
        bed.seed_remote(&[
            "backup-daily-20240114_020000.tar.gz",
            "backup-daily-20240115_020000.tar.gz",
        ]);
        let operator = ScriptedOperator::default().confirms(&[true, false]);

        let plan = prepare_plan(
            &tools,
            &request(Some(Selector::Date("20240115".into()))),
            &operator,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(plan.archive.name, "backup-daily-20240115_020000.tar.gz");
        assert!(plan.confirmed);
        assert!(!plan.restore_config);
        assert!(operator.choices_asked().is_empty());
    }

    #[tokio::test]
    async fn declining_confirmation_returns_declined() {
        let bed = TestBed::new();
        let tools = bed.toolkit();
        bed.seed_remote(&["backup-daily-20240115_020000.tar.gz"]);
        let operator = ScriptedOperator::default().confirms(&[false]);

        let outcome = run_restore_flow(
            &bed.config,
            &tools,
            &request(Some(Selector::Latest(Tier::Daily))),
            &operator,
            at("20240120_100000"),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, RestoreOutcome::Declined));
    }

    #[tokio::test]
    async fn interactive_selection_lets_operator_disambiguate() {
        let bed = TestBed::new();
        let tools = bed.toolkit();
        bed.seed_remote(&[
            "backup-daily-20240115_020000.tar.gz",
            "backup-weekly-20240115_030000.tar.gz",
        ]);
        // Candidates are offered newest first.
        let operator = ScriptedOperator::default()
            .answers(&["20240115"])
            .picks(&[Some(1)])
            .confirms(&[true, true]);

        let plan = prepare_plan(&tools, &request(None), &operator)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.archive.name, "backup-daily-20240115_020000.tar.gz");
        assert!(plan.restore_config);
        assert_eq!(operator.choices_asked(), vec![vec![
            "backup-weekly-20240115_030000.tar.gz".to_string(),
            "backup-daily-20240115_020000.tar.gz".to_string(),
        ]]);
    }

    #[tokio::test]
    async fn interactive_tier_answer_picks_latest() {
        let bed = TestBed::new();
        let tools = bed.toolkit();
        bed.seed_remote(&[
            "backup-weekly-20240107_020000.tar.gz",
            "backup-weekly-20240114_020000.tar.gz",
        ]);
        let operator = ScriptedOperator::default().answers(&["weekly"]);
        let req = RestoreRequest {
            selector: None,
            assume_yes: true,
            config: ConfigChoice::Ask,
        };

        let plan = prepare_plan(&tools, &req, &operator)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(plan.archive.name, "backup-weekly-20240114_020000.tar.gz");
        assert!(plan.confirmed);
        assert!(!plan.restore_config);
    }

    #[tokio::test]
    async fn empty_store_is_not_found() {
        let bed = TestBed::new();
        let tools = bed.toolkit();
        let err = prepare_plan(&tools, &request(None), &ScriptedOperator::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}
