// campus-backup/src/restore/selection.rs
use crate::errors::{AppError, Result};
use crate::storage::{ArchiveDescriptor, ObjectStore, Tier, sort_newest_first};

/// What the operator asked to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Newest archive of one tier.
    Latest(Tier),
    /// Any archive, in any tier, whose name contains this text.
    Date(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Resolved(ArchiveDescriptor),
    /// Several archives match; the operator must pick one.
    Ambiguous(Vec<ArchiveDescriptor>),
}

impl Selection {
    /// The resolved archive, or `SelectionAmbiguous` listing every candidate.
    pub fn into_resolved(self, selector: &Selector) -> Result<ArchiveDescriptor> {
        match self {
            Selection::Resolved(archive) => Ok(archive),
            Selection::Ambiguous(candidates) => Err(AppError::SelectionAmbiguous {
                query: selector.query(),
                candidates: candidates.into_iter().map(|a| a.name).collect(),
            }),
        }
    }
}

impl Selector {
    fn query(&self) -> String {
        match self {
            Selector::Latest(tier) => format!("latest {}", tier),
            Selector::Date(text) => text.clone(),
        }
    }
}

/// Applies `selector` to a listing. Never guesses between several matches.
pub fn select(archives: &[ArchiveDescriptor], selector: &Selector) -> Result<Selection> {
    match selector {
        Selector::Latest(tier) => archives
            .iter()
            .filter(|a| a.tier == *tier)
            .max_by(|a, b| a.name.cmp(&b.name))
            .cloned()
            .map(Selection::Resolved)
            .ok_or_else(|| AppError::NotFound(selector.query())),
        Selector::Date(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Err(AppError::NotFound(String::new()));
            }
            let mut matches: Vec<ArchiveDescriptor> = archives
                .iter()
                .filter(|a| a.name.contains(text))
                .cloned()
                .collect();
            sort_newest_first(&mut matches);
            match matches.len() {
                0 => Err(AppError::NotFound(text.to_string())),
                1 => Ok(Selection::Resolved(matches.remove(0))),
                _ => Ok(Selection::Ambiguous(matches)),
            }
        }
    }
}

/// Lists what the store holds and applies `selector`.
pub async fn resolve(store: &dyn ObjectStore, selector: &Selector) -> Result<Selection> {
    let archives = match selector {
        Selector::Latest(tier) => store.list(*tier).await?,
        Selector::Date(_) => store.list_all().await?,
    };
    select(&archives, selector)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(names: &[&str]) -> Vec<ArchiveDescriptor> {
        names
            .iter()
            .map(|n| ArchiveDescriptor::parse(n).unwrap())
            .collect()
    }

    #[test]
    fn latest_picks_greatest_name_in_tier() {
        let archives = listing(&[
            "backup-daily-20240113_020000.tar.gz",
            "backup-daily-20240115_020000.tar.gz",
            "backup-daily-20240114_020000.tar.gz",
            "backup-weekly-20240121_020000.tar.gz",
        ]);
        let picked = select(&archives, &Selector::Latest(Tier::Daily)).unwrap();
        assert_eq!(
            picked,
            Selection::Resolved(ArchiveDescriptor::parse("backup-daily-20240115_020000.tar.gz").unwrap())
        );
    }

    #[test]
    fn latest_of_empty_tier_is_not_found() {
        let archives = listing(&["backup-daily-20240113_020000.tar.gz"]);
        let err = select(&archives, &Selector::Latest(Tier::Monthly)).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn single_date_match_auto_selects() {
        let archives = listing(&[
            "backup-daily-20240114_020000.tar.gz",
            "backup-daily-20240115_020000.tar.gz",
        ]);
        let picked = select(&archives, &Selector::Date("20240115".into())).unwrap();
        assert!(matches!(picked, Selection::Resolved(ref a) if a.name == "backup-daily-20240115_020000.tar.gz"));
    }

    #[test]
    fn date_without_match_is_not_found() {
        let archives = listing(&["backup-daily-20240114_020000.tar.gz"]);
        let err = select(&archives, &Selector::Date("20240115".into())).unwrap_err();
        assert!(matches!(err, AppError::NotFound(ref q) if q == "20240115"));
    }

    #[test]
    fn daily_and_weekly_on_same_date_is_ambiguous() {
        let archives = listing(&[
            "backup-daily-20240115_020000.tar.gz",
            "backup-weekly-20240115_030000.tar.gz",
            "backup-daily-20240116_020000.tar.gz",
        ]);
        let selector = Selector::Date("20240115".into());
        let selection = select(&archives, &selector).unwrap();
        let Selection::Ambiguous(candidates) = selection.clone() else {
            panic!("expected ambiguity, got {:?}", selection);
        };
        assert_eq!(candidates.len(), 2);

        let err = selection.into_resolved(&selector).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("backup-daily-20240115_020000.tar.gz"));
        assert!(message.contains("backup-weekly-20240115_030000.tar.gz"));
    }
}
