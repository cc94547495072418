//! フェイルオーバー選択
//!
//! {戦略, プロバイダ状態表, 現在のアクティブ} から次のアクティブプロバイダを決める純粋関数群。
//! アクティブポインタはここで決めた値でのみ更新する。

use crate::types::ProviderStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// プロバイダ名 → 状態 の表
pub type StatusTable = HashMap<String, ProviderStatus>;

/// フェイルオーバー戦略
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailoverStrategy {
    /// フェイルオーバーしない（常にプライマリ）
    Disabled,
    /// 宣言順で最初に利用可能なもの
    Ordered,
    /// 利用可能 > 性能低下 の順で選ぶ
    Availability,
    /// 品質指標で選ぶ（指標は未定義。現状は Availability と同じ動作）
    Quality,
}

/// フェイルオーバーポリシー
///
/// 生成後は変更しない。
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverPolicy {
    pub strategy: FailoverStrategy,
    pub primary_provider_id: String,
    /// 優先順（先頭ほど優先）
    pub failover_provider_ids: Vec<String>,
    pub auto_restore_primary: bool,
    pub health_check_interval_seconds: u64,
}

impl FailoverPolicy {
    /// `[primary] + failover` を宣言順に返す（重複は除く）
    pub fn declared_order(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = vec![self.primary_provider_id.as_str()];
        for id in &self.failover_provider_ids {
            if !ids.contains(&id.as_str()) {
                ids.push(id.as_str());
            }
        }
        ids
    }
}

fn status_of(statuses: &StatusTable, id: &str) -> ProviderStatus {
    statuses.get(id).copied().unwrap_or(ProviderStatus::Unknown)
}

/// 次のアクティブプロバイダを選択
///
/// # Examples
///
/// ```
/// # use voice_failover::failover::{select, FailoverPolicy, FailoverStrategy, StatusTable};
/// # use voice_failover::types::ProviderStatus;
/// let policy = FailoverPolicy {
///     strategy: FailoverStrategy::Ordered,
///     primary_provider_id: "google".to_string(),
///     failover_provider_ids: vec!["azure".to_string(), "whisper".to_string()],
///     auto_restore_primary: true,
///     health_check_interval_seconds: 300,
/// };
/// let mut statuses = StatusTable::new();
/// statuses.insert("google".to_string(), ProviderStatus::Unavailable);
/// statuses.insert("azure".to_string(), ProviderStatus::Available);
///
/// assert_eq!(select(&policy, &statuses, "google"), "azure");
/// ```
pub fn select(policy: &FailoverPolicy, statuses: &StatusTable, current_active: &str) -> String {
    match policy.strategy {
        FailoverStrategy::Disabled => policy.primary_provider_id.clone(),
        FailoverStrategy::Ordered => policy
            .declared_order()
            .into_iter()
            .find(|id| status_of(statuses, id) == ProviderStatus::Available)
            .map(str::to_string)
            .unwrap_or_else(|| current_active.to_string()),
        FailoverStrategy::Availability => select_by_availability(policy, statuses, current_active),
        FailoverStrategy::Quality => rank_by_quality(policy, statuses, current_active)
            .unwrap_or_else(|| select_by_availability(policy, statuses, current_active)),
    }
}

fn select_by_availability(
    policy: &FailoverPolicy,
    statuses: &StatusTable,
    current_active: &str,
) -> String {
    if status_of(statuses, current_active) == ProviderStatus::Available {
        return current_active.to_string();
    }

    let declared = policy.declared_order();
    let first_with = |wanted: ProviderStatus| {
        declared
            .iter()
            .find(|id| status_of(statuses, id) == wanted)
            .map(|id| id.to_string())
    };

    first_with(ProviderStatus::Available)
        .or_else(|| first_with(ProviderStatus::Degraded))
        .unwrap_or_else(|| current_active.to_string())
}

/// 品質指標によるランキング（拡張ポイント）
///
/// 品質シグナルはまだ定義されていないため常に `None` を返し、
/// 呼び出し側は Availability 戦略にフォールバックする。
pub fn rank_by_quality(
    _policy: &FailoverPolicy,
    _statuses: &StatusTable,
    _current_active: &str,
) -> Option<String> {
    None
}

/// ヘルスチェック後のアクティブプロバイダを決定
///
/// 自動復帰が有効でプライマリが利用可能ならプライマリへ戻す。
/// そうでなく現在のアクティブが利用不可なら `select` で選び直す。
pub fn reconcile_after_health_check(
    policy: &FailoverPolicy,
    statuses: &StatusTable,
    current_active: &str,
) -> String {
    if policy.strategy == FailoverStrategy::Disabled {
        return policy.primary_provider_id.clone();
    }

    if policy.auto_restore_primary
        && status_of(statuses, &policy.primary_provider_id) == ProviderStatus::Available
    {
        return policy.primary_provider_id.clone();
    }

    if status_of(statuses, current_active) != ProviderStatus::Available {
        return select(policy, statuses, current_active);
    }

    current_active.to_string()
}

/// プロバイダ登録解除後のアクティブプロバイダを決定
pub fn reconcile_after_unregister(
    policy: &FailoverPolicy,
    current_active: &str,
    removed_id: &str,
) -> String {
    if current_active == removed_id {
        policy.primary_provider_id.clone()
    } else {
        current_active.to_string()
    }
}

/// リクエストで試す候補プロバイダの順序
///
/// アクティブを先頭に、残りをポリシーの順で並べる。
/// `registered` は登録済みプロバイダ（登録順）で、宣言にないものは末尾に付ける。
/// Disabled の場合はプライマリのみ。
pub fn candidate_order(
    policy: &FailoverPolicy,
    statuses: &StatusTable,
    current_active: &str,
    registered: &[String],
) -> Vec<String> {
    if policy.strategy == FailoverStrategy::Disabled {
        return vec![policy.primary_provider_id.clone()];
    }

    let mut rest: Vec<String> = Vec::new();
    for id in policy
        .declared_order()
        .into_iter()
        .chain(registered.iter().map(String::as_str))
    {
        if id != current_active && !rest.iter().any(|r| r == id) {
            rest.push(id.to_string());
        }
    }

    if matches!(
        policy.strategy,
        FailoverStrategy::Availability | FailoverStrategy::Quality
    ) {
        // 安定ソート: Available → Degraded → その他
        rest.sort_by_key(|id| match status_of(statuses, id) {
            ProviderStatus::Available => 0,
            ProviderStatus::Degraded => 1,
            _ => 2,
        });
    }

    let mut candidates = vec![current_active.to_string()];
    candidates.extend(rest);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: FailoverStrategy) -> FailoverPolicy {
        FailoverPolicy {
            strategy,
            primary_provider_id: "google".to_string(),
            failover_provider_ids: vec!["azure".to_string(), "whisper".to_string()],
            auto_restore_primary: true,
            health_check_interval_seconds: 300,
        }
    }

    fn table(entries: &[(&str, ProviderStatus)]) -> StatusTable {
        entries
            .iter()
            .map(|(id, status)| (id.to_string(), *status))
            .collect()
    }

    #[test]
    fn test_disabled_always_returns_primary() {
        let policy = policy(FailoverStrategy::Disabled);
        let tables = [
            table(&[("google", ProviderStatus::Unavailable), ("azure", ProviderStatus::Available)]),
            table(&[("google", ProviderStatus::Error)]),
            table(&[]),
            table(&[("google", ProviderStatus::Available)]),
        ];

        for statuses in &tables {
            assert_eq!(select(&policy, statuses, "azure"), "google");
            assert_eq!(select(&policy, statuses, "whisper"), "google");
        }
    }

    #[test]
    fn test_ordered_picks_first_available() {
        let policy = policy(FailoverStrategy::Ordered);
        let statuses = table(&[
            ("google", ProviderStatus::Unavailable),
            ("azure", ProviderStatus::Available),
            ("whisper", ProviderStatus::Available),
        ]);

        assert_eq!(select(&policy, &statuses, "google"), "azure");
    }

    #[test]
    fn test_ordered_keeps_current_when_none_available() {
        let policy = policy(FailoverStrategy::Ordered);
        let statuses = table(&[
            ("google", ProviderStatus::Unavailable),
            ("azure", ProviderStatus::Degraded),
            ("whisper", ProviderStatus::Error),
        ]);

        assert_eq!(select(&policy, &statuses, "whisper"), "whisper");
    }

    #[test]
    fn test_ordered_prefers_primary_when_available() {
        let policy = policy(FailoverStrategy::Ordered);
        let statuses = table(&[
            ("google", ProviderStatus::Available),
            ("azure", ProviderStatus::Available),
        ]);

        assert_eq!(select(&policy, &statuses, "azure"), "google");
    }

    #[test]
    fn test_availability_keeps_current_if_available() {
        let policy = policy(FailoverStrategy::Availability);
        let statuses = table(&[
            ("google", ProviderStatus::Available),
            ("azure", ProviderStatus::Available),
        ]);

        assert_eq!(select(&policy, &statuses, "azure"), "azure");
    }

    #[test]
    fn test_availability_falls_back_to_degraded() {
        let policy = policy(FailoverStrategy::Availability);
        let statuses = table(&[
            ("google", ProviderStatus::Unavailable),
            ("azure", ProviderStatus::Error),
            ("whisper", ProviderStatus::Degraded),
        ]);

        assert_eq!(select(&policy, &statuses, "google"), "whisper");
    }

    #[test]
    fn test_availability_declared_order_tie_break() {
        let policy = policy(FailoverStrategy::Availability);
        let statuses = table(&[
            ("google", ProviderStatus::Degraded),
            ("azure", ProviderStatus::Available),
            ("whisper", ProviderStatus::Available),
        ]);

        assert_eq!(select(&policy, &statuses, "google"), "azure");
    }

    #[test]
    fn test_availability_unchanged_when_nothing_usable() {
        let policy = policy(FailoverStrategy::Availability);
        let statuses = table(&[("google", ProviderStatus::Unavailable)]);

        assert_eq!(select(&policy, &statuses, "azure"), "azure");
    }

    #[test]
    fn test_quality_behaves_like_availability() {
        let quality = policy(FailoverStrategy::Quality);
        let availability = policy(FailoverStrategy::Availability);
        let statuses = table(&[
            ("google", ProviderStatus::Unavailable),
            ("azure", ProviderStatus::Degraded),
            ("whisper", ProviderStatus::Available),
        ]);

        assert_eq!(
            select(&quality, &statuses, "google"),
            select(&availability, &statuses, "google")
        );
        assert!(rank_by_quality(&quality, &statuses, "google").is_none());
    }

    #[test]
    fn test_reconcile_restores_primary() {
        let policy = policy(FailoverStrategy::Availability);
        let statuses = table(&[
            ("google", ProviderStatus::Available),
            ("azure", ProviderStatus::Available),
        ]);

        assert_eq!(reconcile_after_health_check(&policy, &statuses, "azure"), "google");
    }

    #[test]
    fn test_reconcile_without_auto_restore_keeps_healthy_current() {
        let mut policy = policy(FailoverStrategy::Availability);
        policy.auto_restore_primary = false;
        let statuses = table(&[
            ("google", ProviderStatus::Available),
            ("azure", ProviderStatus::Available),
        ]);

        assert_eq!(reconcile_after_health_check(&policy, &statuses, "azure"), "azure");
    }

    #[test]
    fn test_reconcile_replaces_unhealthy_current() {
        let mut policy = policy(FailoverStrategy::Availability);
        policy.auto_restore_primary = false;
        let statuses = table(&[
            ("google", ProviderStatus::Unavailable),
            ("azure", ProviderStatus::Unavailable),
            ("whisper", ProviderStatus::Available),
        ]);

        assert_eq!(reconcile_after_health_check(&policy, &statuses, "azure"), "whisper");
    }

    #[test]
    fn test_reconcile_after_unregister() {
        let policy = policy(FailoverStrategy::Ordered);
        assert_eq!(reconcile_after_unregister(&policy, "azure", "azure"), "google");
        assert_eq!(reconcile_after_unregister(&policy, "azure", "whisper"), "azure");
    }

    #[test]
    fn test_candidate_order_ordered() {
        let policy = policy(FailoverStrategy::Ordered);
        let registered = vec![
            "google".to_string(),
            "azure".to_string(),
            "whisper".to_string(),
            "local".to_string(),
        ];

        let candidates = candidate_order(&policy, &StatusTable::new(), "azure", &registered);
        assert_eq!(candidates, vec!["azure", "google", "whisper", "local"]);
    }

    #[test]
    fn test_candidate_order_availability_sorts_rest() {
        let policy = policy(FailoverStrategy::Availability);
        let statuses = table(&[
            ("google", ProviderStatus::Unavailable),
            ("azure", ProviderStatus::Degraded),
            ("whisper", ProviderStatus::Available),
        ]);
        let registered = vec!["google".to_string(), "azure".to_string(), "whisper".to_string()];

        let candidates = candidate_order(&policy, &statuses, "google", &registered);
        assert_eq!(candidates, vec!["google", "whisper", "azure"]);
    }

    #[test]
    fn test_candidate_order_disabled_is_primary_only() {
        let policy = policy(FailoverStrategy::Disabled);
        let registered = vec!["google".to_string(), "azure".to_string()];

        let candidates = candidate_order(&policy, &StatusTable::new(), "google", &registered);
        assert_eq!(candidates, vec!["google"]);
    }

    #[test]
    fn test_strategy_serialization() {
        let json = serde_json::to_string(&FailoverStrategy::Availability).unwrap();
        assert_eq!(json, r#""availability""#);

        let strategy: FailoverStrategy = serde_json::from_str(r#""disabled""#).unwrap();
        assert_eq!(strategy, FailoverStrategy::Disabled);
    }
}
