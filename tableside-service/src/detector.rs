//! Bot and abuse heuristics. Every check is a pure function of the session
//! (when there is one), the recent order history and the incoming order;
//! callers decide what to do with the verdict.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, Rejection};
use crate::models::{OrderLineItem, OrderStatus, TableSession};
use crate::store::OrderRecord;

/// Ordered by severity.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Allow,
    Warn,
    Confirm,
    Wait,
    Block,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    pub burst_window: Duration,
    pub burst_limit: usize,
    pub burst_confidence: f64,
    pub pace_window: Duration,
    pub pace_limit: usize,
    pub pace_confidence: f64,
    pub pace_wait_seconds: u32,
    pub large_line_quantity: i32,
    pub large_line_confidence: f64,
    pub large_order_items: i32,
    pub large_order_confidence: f64,
    pub timing_window: Duration,
    pub timing_max_samples: usize,
    pub timing_min_samples: usize,
    pub timing_max_variation: f64,
    pub timing_confidence: f64,
    pub duplicate_window: Duration,
    /// Also compare quantities when looking for duplicates.
    pub strict_duplicates: bool,
    pub block_threshold: f64,
    pub wait_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            burst_window: Duration::seconds(60),
            burst_limit: 5,
            burst_confidence: 0.95,
            pace_window: Duration::seconds(10),
            pace_limit: 2,
            pace_confidence: 0.75,
            pace_wait_seconds: 10,
            large_line_quantity: 10,
            large_line_confidence: 0.6,
            large_order_items: 20,
            large_order_confidence: 0.5,
            timing_window: Duration::minutes(5),
            timing_max_samples: 10,
            timing_min_samples: 4,
            timing_max_variation: 0.2,
            timing_confidence: 0.9,
            duplicate_window: Duration::seconds(60),
            strict_duplicates: false,
            block_threshold: 0.9,
            wait_threshold: 0.7,
        }
    }
}

impl DetectorConfig {
    /// How far back the history passed to [`evaluate`] must reach.
    pub fn history_window(&self) -> Duration {
        self.burst_window
            .max(self.timing_window)
            .max(self.duplicate_window)
    }
}

/// One check that fired.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Finding {
    pub code: ErrorCode,
    pub confidence: f64,
    pub action: Action,
    pub reason: String,
    pub wait_seconds: Option<u32>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Verdict {
    pub is_bot: bool,
    pub confidence: f64,
    pub action: Action,
    pub code: Option<ErrorCode>,
    pub reason: Option<String>,
    pub wait_seconds: Option<u32>,
    pub findings: Vec<Finding>,
}

impl Verdict {
    pub fn clean() -> Self {
        Self {
            is_bot: false,
            confidence: 0.0,
            action: Action::Allow,
            code: None,
            reason: None,
            wait_seconds: None,
            findings: vec![],
        }
    }

    pub fn rejection(&self) -> Rejection {
        Rejection {
            code: self.code.unwrap_or(ErrorCode::BotDetected),
            action: self.action,
            reason: self
                .reason
                .clone()
                .unwrap_or_else(|| "order looks automated".to_string()),
            confidence: self.confidence,
            wait_seconds: self.wait_seconds,
            retryable: self.action != Action::Block,
        }
    }
}

fn orders_since<'a>(
    history: &'a [OrderRecord],
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> impl Iterator<Item = &'a OrderRecord> {
    history
        .iter()
        .filter(move |r| r.order.created_at > since && r.order.created_at <= now)
}

/// Counts include the incoming order. The session's own sliding window, when
/// there is a session, is a lower bound in case the history is incomplete.
pub fn check_rapid_orders(
    session: Option<&TableSession>,
    history: &[OrderRecord],
    now: DateTime<Utc>,
    config: &DetectorConfig,
) -> Option<Finding> {
    let window_start = now - config.burst_window;
    let tracked = match session {
        Some(session)
            if session
                .recent_orders_window_start
                .is_some_and(|start| start > window_start) =>
        {
            session.recent_orders_count.max(0) as usize
        }
        _ => 0,
    };
    let burst = orders_since(history, window_start, now).count().max(tracked) + 1;
    if burst >= config.burst_limit {
        return Some(Finding {
            code: ErrorCode::RateLimitExceeded,
            confidence: config.burst_confidence,
            action: Action::Block,
            reason: format!(
                "{burst} orders within {} seconds",
                config.burst_window.num_seconds()
            ),
            wait_seconds: None,
        });
    }

    let pace = orders_since(history, now - config.pace_window, now).count() + 1;
    if pace >= config.pace_limit {
        return Some(Finding {
            code: ErrorCode::SlowDown,
            confidence: config.pace_confidence,
            action: Action::Wait,
            reason: format!(
                "{pace} orders within {} seconds",
                config.pace_window.num_seconds()
            ),
            wait_seconds: Some(config.pace_wait_seconds),
        });
    }

    None
}

pub fn check_oversized(items: &[OrderLineItem], config: &DetectorConfig) -> Option<Finding> {
    if let Some(item) = items
        .iter()
        .find(|i| i.quantity >= config.large_line_quantity)
    {
        return Some(Finding {
            code: ErrorCode::ConfirmationRequired,
            confidence: config.large_line_confidence,
            action: Action::Confirm,
            reason: format!("{} x {} in a single line", item.quantity, item.name),
            wait_seconds: None,
        });
    }

    let total: i32 = items.iter().map(|i| i.quantity).sum();
    if total >= config.large_order_items {
        return Some(Finding {
            code: ErrorCode::ConfirmationRequired,
            confidence: config.large_order_confidence,
            action: Action::Confirm,
            reason: format!("{total} items in one order"),
            wait_seconds: None,
        });
    }

    None
}

/// Looks at the spacing of the most recent orders; humans are not metronomes.
pub fn check_uniform_timing(
    history: &[OrderRecord],
    now: DateTime<Utc>,
    config: &DetectorConfig,
) -> Option<Finding> {
    let mut times: Vec<DateTime<Utc>> = orders_since(history, now - config.timing_window, now)
        .map(|r| r.order.created_at)
        .collect();
    times.sort();
    let skip = times.len().saturating_sub(config.timing_max_samples);
    let times = &times[skip..];
    if times.len() < config.timing_min_samples {
        return None;
    }

    let intervals: Vec<f64> = times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).num_milliseconds() as f64)
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    let variance = intervals
        .iter()
        .map(|i| (i - mean).powi(2))
        .sum::<f64>()
        / intervals.len() as f64;
    let variation = variance.sqrt() / mean;
    if variation >= config.timing_max_variation {
        return None;
    }

    Some(Finding {
        code: ErrorCode::BotDetected,
        confidence: config.timing_confidence,
        action: Action::Block,
        reason: format!(
            "last {} orders arrived every {:.1}s with {:.0}% variation",
            times.len(),
            mean / 1000.0,
            variation * 100.0
        ),
        wait_seconds: None,
    })
}

/// Combines findings by maximum severity.
pub fn combine(mut findings: Vec<Finding>, config: &DetectorConfig) -> Verdict {
    findings.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let Some(top) = findings.first() else {
        return Verdict::clean();
    };
    let confidence = top.confidence;
    let reason = findings
        .iter()
        .map(|f| f.reason.as_str())
        .collect::<Vec<_>>()
        .join("; ");

    let (is_bot, action, code, wait_seconds) = if confidence >= config.block_threshold {
        let code = if top.action == Action::Block {
            top.code
        } else {
            ErrorCode::BotDetected
        };
        (true, Action::Block, code, None)
    } else if confidence >= config.wait_threshold {
        let wait = findings
            .iter()
            .filter_map(|f| f.wait_seconds)
            .max()
            .unwrap_or(config.pace_wait_seconds);
        (true, Action::Wait, ErrorCode::SlowDown, Some(wait))
    } else if let Some(confirm) = findings.iter().find(|f| f.action == Action::Confirm) {
        (false, Action::Confirm, confirm.code, None)
    } else {
        (false, Action::Warn, top.code, None)
    };

    Verdict {
        is_bot,
        confidence,
        action,
        code: Some(code),
        reason: Some(reason),
        wait_seconds,
        findings,
    }
}

/// `history` holds the orders from the last [`DetectorConfig::history_window`]:
/// the session's when there is one, otherwise the table's.
pub fn evaluate(
    session: Option<&TableSession>,
    items: &[OrderLineItem],
    history: &[OrderRecord],
    now: DateTime<Utc>,
    config: &DetectorConfig,
) -> Verdict {
    let findings = [
        check_rapid_orders(session, history, now, config),
        check_oversized(items, config),
        check_uniform_timing(history, now, config),
    ]
    .into_iter()
    .flatten()
    .collect();

    combine(findings, config)
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub matched_order: Option<Uuid>,
    pub action: Action,
}

fn item_key(items: &[OrderLineItem], strict: bool) -> Vec<(&str, i32)> {
    let mut key: Vec<(&str, i32)> = items
        .iter()
        .map(|i| (i.menu_item_id.as_str(), if strict { i.quantity } else { 0 }))
        .collect();
    key.sort();
    key
}

/// Two orders are duplicates when they carry the same multiset of menu item
/// ids; quantities only count in strict mode. Cancelled orders are ignored.
pub fn check_duplicate(
    items: &[OrderLineItem],
    history: &[OrderRecord],
    now: DateTime<Utc>,
    config: &DetectorConfig,
) -> DuplicateCheck {
    let key = item_key(items, config.strict_duplicates);
    let matched = orders_since(history, now - config.duplicate_window, now)
        .filter(|r| r.order.status != OrderStatus::Cancelled)
        .find(|r| item_key(&r.items, config.strict_duplicates) == key)
        .map(|r| r.order.id);

    DuplicateCheck {
        is_duplicate: matched.is_some(),
        matched_order: matched,
        action: if matched.is_some() {
            Action::Confirm
        } else {
            Action::Allow
        },
    }
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;

    use super::*;
    use crate::models::{
        Customizations, DiningTable, Order, OrderPriority, OrderType, PaymentStatus,
        SelectedOptions, TableStatus,
    };

    fn line(menu_item_id: &str, quantity: i32) -> OrderLineItem {
        OrderLineItem {
            id: Uuid::new_v4(),
            order_id: Uuid::nil(),
            position: 0,
            menu_item_id: menu_item_id.to_string(),
            name: menu_item_id.to_uppercase(),
            price: BigDecimal::from(5),
            quantity,
            subtotal: BigDecimal::from(5 * quantity),
            customizations: Customizations::default(),
            selected_options: SelectedOptions::default(),
            notes: None,
        }
    }

    fn past_order(created_at: DateTime<Utc>, items: Vec<OrderLineItem>) -> OrderRecord {
        OrderRecord {
            order: Order {
                id: Uuid::new_v4(),
                version: 1,
                order_number: "ORD-20250301-0001".to_string(),
                table_id: Uuid::nil(),
                table_number: 7,
                session_id: None,
                device_fingerprint: None,
                status: OrderStatus::Pending,
                payment_status: PaymentStatus::Pending,
                priority: OrderPriority::Normal,
                order_type: OrderType::DineIn,
                total_amount: BigDecimal::from(5),
                estimated_time: 15,
                notes: None,
                assigned_staff: None,
                cancel_reason: None,
                created_at,
                confirmed_at: None,
                preparing_at: None,
                ready_at: None,
                delivered_at: None,
                completed_at: None,
                cancelled_at: None,
                paid_at: None,
                updated_at: created_at,
            },
            items,
        }
    }

    fn session(now: DateTime<Utc>) -> TableSession {
        let table = DiningTable {
            id: Uuid::new_v4(),
            number: 7,
            status: TableStatus::Occupied,
            updated_at: now,
        };
        TableSession::new(&table, now - Duration::hours(1), Duration::hours(4))
    }

    #[test]
    fn test_clean_order_is_allowed() {
        let now = Utc::now();
        let verdict = evaluate(
            Some(&session(now)),
            &[line("pho", 1)],
            &[],
            now,
            &DetectorConfig::default(),
        );

        assert_eq!(verdict, Verdict::clean());
    }

    #[test]
    fn test_fifth_order_in_a_minute_is_blocked() {
        let now = Utc::now();
        let history: Vec<_> = (1..=4)
            .map(|i| past_order(now - Duration::seconds(12 * i), vec![line("pho", 1)]))
            .collect();

        let verdict = evaluate(
            Some(&session(now)),
            &[line("ramen", 1)],
            &history,
            now,
            &DetectorConfig::default(),
        );

        assert!(verdict.is_bot);
        assert_eq!(verdict.action, Action::Block);
        assert_eq!(verdict.code, Some(ErrorCode::RateLimitExceeded));
        assert!(!verdict.rejection().retryable);
    }

    #[test]
    fn test_session_window_counts_when_history_is_short() {
        let now = Utc::now();
        let mut session = session(now);
        session.recent_orders_count = 4;
        session.recent_orders_window_start = Some(now - Duration::seconds(40));

        let finding = check_rapid_orders(Some(&session), &[], now, &DetectorConfig::default());
        assert_eq!(finding.map(|f| f.action), Some(Action::Block));
    }

    #[test]
    fn test_orders_without_session_are_judged_on_history() {
        let now = Utc::now();
        let history: Vec<_> = (1..=4)
            .map(|i| past_order(now - Duration::seconds(12 * i), vec![line("pho", 1)]))
            .collect();
        let config = DetectorConfig::default();

        let verdict = evaluate(None, &[line("ramen", 1)], &history, now, &config);
        assert_eq!(verdict.action, Action::Block);
        assert_eq!(verdict.code, Some(ErrorCode::RateLimitExceeded));

        let verdict = evaluate(None, &[line("beer", 12)], &[], now, &config);
        assert_eq!(verdict.action, Action::Confirm);
    }

    #[test]
    fn test_second_order_within_ten_seconds_waits() {
        let now = Utc::now();
        let history = vec![past_order(now - Duration::seconds(4), vec![line("pho", 1)])];

        let verdict = evaluate(
            Some(&session(now)),
            &[line("ramen", 1)],
            &history,
            now,
            &DetectorConfig::default(),
        );

        assert!(verdict.is_bot);
        assert_eq!(verdict.action, Action::Wait);
        assert_eq!(verdict.code, Some(ErrorCode::SlowDown));
        assert_eq!(verdict.wait_seconds, Some(10));
        assert!(verdict.rejection().retryable);
    }

    #[test]
    fn test_metronome_spacing_is_flagged() {
        let now = Utc::now();
        let offsets_ms = [150_000, 120_500, 90_000, 59_500, 30_000];
        let history: Vec<_> = offsets_ms
            .iter()
            .map(|ms| past_order(now - Duration::milliseconds(*ms), vec![line("pho", 1)]))
            .collect();

        let verdict = evaluate(
            Some(&session(now)),
            &[line("ramen", 1)],
            &history,
            now,
            &DetectorConfig::default(),
        );

        assert!(verdict.is_bot);
        assert!(verdict.confidence >= 0.9);
        assert_eq!(verdict.action, Action::Block);
        assert_eq!(verdict.code, Some(ErrorCode::BotDetected));
    }

    #[test]
    fn test_irregular_spacing_is_not_flagged() {
        let now = Utc::now();
        let history: Vec<_> = [280, 200, 170, 80, 25]
            .iter()
            .map(|s| past_order(now - Duration::seconds(*s), vec![line("pho", 1)]))
            .collect();

        assert_eq!(
            check_uniform_timing(&history, now, &DetectorConfig::default()),
            None
        );
    }

    #[test]
    fn test_too_few_samples_skip_timing_check() {
        let now = Utc::now();
        let history: Vec<_> = [90, 60, 30]
            .iter()
            .map(|s| past_order(now - Duration::seconds(*s), vec![line("pho", 1)]))
            .collect();

        assert_eq!(
            check_uniform_timing(&history, now, &DetectorConfig::default()),
            None
        );
    }

    #[test]
    fn test_large_orders_ask_for_confirmation() {
        let now = Utc::now();
        let config = DetectorConfig::default();

        let verdict = evaluate(Some(&session(now)), &[line("beer", 12)], &[], now, &config);
        assert!(!verdict.is_bot);
        assert_eq!(verdict.action, Action::Confirm);
        assert_eq!(verdict.confidence, 0.6);
        assert_eq!(verdict.code, Some(ErrorCode::ConfirmationRequired));

        let many: Vec<_> = (0..4).map(|i| line(&format!("dish-{i}"), 5)).collect();
        let verdict = evaluate(Some(&session(now)), &many, &[], now, &config);
        assert_eq!(verdict.action, Action::Confirm);
        assert_eq!(verdict.confidence, 0.5);
    }

    #[test]
    fn test_block_outranks_confirm() {
        let config = DetectorConfig::default();
        let findings = vec![
            Finding {
                code: ErrorCode::ConfirmationRequired,
                confidence: 0.6,
                action: Action::Confirm,
                reason: "big".to_string(),
                wait_seconds: None,
            },
            Finding {
                code: ErrorCode::RateLimitExceeded,
                confidence: 0.95,
                action: Action::Block,
                reason: "fast".to_string(),
                wait_seconds: None,
            },
        ];

        let verdict = combine(findings, &config);
        assert_eq!(verdict.action, Action::Block);
        assert_eq!(verdict.code, Some(ErrorCode::RateLimitExceeded));
        assert_eq!(verdict.reason.as_deref(), Some("fast; big"));
    }

    #[test]
    fn test_duplicate_ignores_order_and_quantity() {
        let now = Utc::now();
        let history = vec![past_order(
            now - Duration::seconds(30),
            vec![line("pho", 1), line("tea", 2)],
        )];
        let config = DetectorConfig::default();

        let check = check_duplicate(&[line("tea", 1), line("pho", 3)], &history, now, &config);
        assert!(check.is_duplicate);
        assert_eq!(check.action, Action::Confirm);
        assert_eq!(check.matched_order, Some(history[0].order.id));

        let strict = DetectorConfig {
            strict_duplicates: true,
            ..DetectorConfig::default()
        };
        let check = check_duplicate(&[line("tea", 1), line("pho", 3)], &history, now, &strict);
        assert!(!check.is_duplicate);
    }

    #[test]
    fn test_duplicate_window_is_sixty_seconds() {
        let now = Utc::now();
        let history = vec![past_order(now - Duration::seconds(90), vec![line("pho", 1)])];

        let check = check_duplicate(&[line("pho", 1)], &history, now, &DetectorConfig::default());
        assert!(!check.is_duplicate);
        assert_eq!(check.action, Action::Allow);
    }
}
