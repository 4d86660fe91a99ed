use std::cmp::Ordering;
use std::collections::BTreeMap;

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{OrderStatus, PaymentStatus, SessionStatus, TableSession};
use crate::store::OrderRecord;

/// Dashboard filter over orders. Set fields combine with AND; the values of
/// one multi-value field combine with OR.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct OrderFilter {
    #[serde(default)]
    pub statuses: Vec<OrderStatus>,
    #[serde(default)]
    pub payment_statuses: Vec<PaymentStatus>,
    #[serde(default)]
    pub table_numbers: Vec<i32>,
    pub session_id: Option<Uuid>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub assigned_staff: Option<String>,
    pub min_amount: Option<BigDecimal>,
    pub max_amount: Option<BigDecimal>,
    /// Case-insensitive match on order number, item names and notes.
    pub search: Option<String>,
}

impl OrderFilter {
    pub fn matches(&self, record: &OrderRecord) -> bool {
        let order = &record.order;

        (self.statuses.is_empty() || self.statuses.contains(&order.status))
            && (self.payment_statuses.is_empty()
                || self.payment_statuses.contains(&order.payment_status))
            && (self.table_numbers.is_empty() || self.table_numbers.contains(&order.table_number))
            && self.session_id.is_none_or(|id| order.session_id == Some(id))
            && self.created_from.is_none_or(|from| order.created_at >= from)
            && self.created_to.is_none_or(|to| order.created_at <= to)
            && self
                .assigned_staff
                .as_deref()
                .is_none_or(|staff| order.assigned_staff.as_deref() == Some(staff))
            && self
                .min_amount
                .as_ref()
                .is_none_or(|min| &order.total_amount >= min)
            && self
                .max_amount
                .as_ref()
                .is_none_or(|max| &order.total_amount <= max)
            && self.search_term().is_none_or(|term| matches_search(record, &term))
    }

    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }
}

fn matches_search(record: &OrderRecord, term: &str) -> bool {
    let contains = |text: &str| text.to_lowercase().contains(term);

    contains(&record.order.order_number)
        || record.order.notes.as_deref().is_some_and(contains)
        || record
            .items
            .iter()
            .any(|item| contains(&item.name) || item.notes.as_deref().is_some_and(contains))
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    TotalAmount,
    Status,
    Priority,
    OrderNumber,
    TableNumber,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderSort {
    #[serde(default)]
    pub field: SortField,
    #[serde(default)]
    pub direction: SortDirection,
}

impl OrderSort {
    /// Status and priority ties are broken by creation time, oldest first.
    pub fn compare(&self, a: &OrderRecord, b: &OrderRecord) -> Ordering {
        let (a, b) = (&a.order, &b.order);
        let primary = match self.field {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::TotalAmount => a.total_amount.cmp(&b.total_amount),
            SortField::Status => a.status.rank().cmp(&b.status.rank()),
            SortField::Priority => a.priority.rank().cmp(&b.priority.rank()),
            SortField::OrderNumber => a.order_number.cmp(&b.order_number),
            SortField::TableNumber => a.table_number.cmp(&b.table_number),
        };
        let primary = match self.direction {
            SortDirection::Asc => primary,
            SortDirection::Desc => primary.reverse(),
        };
        match self.field {
            SortField::Status | SortField::Priority => {
                primary.then_with(|| a.created_at.cmp(&b.created_at))
            }
            _ => primary,
        }
    }

    pub fn apply(&self, records: &mut [OrderRecord]) {
        records.sort_by(|a, b| self.compare(a, b));
    }
}

#[derive(Serialize, Debug, PartialEq)]
pub struct OrderStats {
    pub total_orders: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    pub revenue: BigDecimal,
    pub average_order_value: BigDecimal,
    pub average_estimated_time: f64,
    pub paid_orders: usize,
}

/// Revenue and averages leave cancelled orders out.
pub fn order_stats(records: &[OrderRecord]) -> OrderStats {
    let mut by_status: BTreeMap<&'static str, usize> =
        OrderStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
    let mut revenue = BigDecimal::zero();
    let mut billable = 0usize;
    let mut estimate_total = 0i64;
    let mut paid_orders = 0usize;

    for record in records {
        let order = &record.order;
        *by_status.entry(order.status.as_str()).or_default() += 1;
        if order.payment_status == PaymentStatus::Paid {
            paid_orders += 1;
        }
        if order.status != OrderStatus::Cancelled {
            revenue += &order.total_amount;
            estimate_total += i64::from(order.estimated_time);
            billable += 1;
        }
    }

    let (average_order_value, average_estimated_time) = if billable == 0 {
        (BigDecimal::zero(), 0.0)
    } else {
        (
            (&revenue / BigDecimal::from(billable as u64)).round(2),
            estimate_total as f64 / billable as f64,
        )
    };

    OrderStats {
        total_orders: records.len(),
        by_status,
        revenue,
        average_order_value,
        average_estimated_time,
        paid_orders,
    }
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct SessionFilter {
    #[serde(default)]
    pub statuses: Vec<SessionStatus>,
    #[serde(default)]
    pub table_numbers: Vec<i32>,
    pub flagged: Option<bool>,
    pub started_from: Option<DateTime<Utc>>,
    pub started_to: Option<DateTime<Utc>>,
}

impl SessionFilter {
    pub fn matches(&self, session: &TableSession) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&session.status))
            && (self.table_numbers.is_empty()
                || self.table_numbers.contains(&session.table_number))
            && self
                .flagged
                .is_none_or(|flagged| session.is_suspicious == flagged)
            && self.started_from.is_none_or(|from| session.start_time >= from)
            && self.started_to.is_none_or(|to| session.start_time <= to)
    }
}

/// Newest sessions first.
pub fn sort_sessions(sessions: &mut [TableSession]) {
    sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
}

#[derive(Serialize, Debug, PartialEq)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active: usize,
    pub expired: usize,
    pub closed: usize,
    pub flagged: usize,
    pub average_devices: f64,
    pub average_orders: f64,
    pub total_revenue: BigDecimal,
}

pub fn session_stats(sessions: &[TableSession]) -> SessionStats {
    let count = |status: SessionStatus| sessions.iter().filter(|s| s.status == status).count();
    let average = |total: i64| {
        if sessions.is_empty() {
            0.0
        } else {
            total as f64 / sessions.len() as f64
        }
    };
    let devices: i64 = sessions.iter().map(|s| i64::from(s.total_devices)).sum();
    let orders: i64 = sessions.iter().map(|s| i64::from(s.order_count)).sum();
    let total_revenue: BigDecimal = sessions.iter().map(|s| s.total_amount.clone()).sum();

    SessionStats {
        total_sessions: sessions.len(),
        active: count(SessionStatus::Active),
        expired: count(SessionStatus::Expired),
        closed: count(SessionStatus::Closed),
        flagged: sessions.iter().filter(|s| s.is_suspicious).count(),
        average_devices: average(devices),
        average_orders: average(orders),
        total_revenue,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::{
        Customizations, Order, OrderLineItem, OrderPriority, OrderType, SelectedOptions,
    };

    fn record(
        number: &str,
        status: OrderStatus,
        priority: OrderPriority,
        amount: i32,
        created_at: DateTime<Utc>,
        item: &str,
    ) -> OrderRecord {
        let id = Uuid::new_v4();
        OrderRecord {
            order: Order {
                id,
                version: 1,
                order_number: number.to_string(),
                table_id: Uuid::nil(),
                table_number: 1,
                session_id: None,
                device_fingerprint: None,
                status,
                payment_status: PaymentStatus::Pending,
                priority,
                order_type: OrderType::DineIn,
                total_amount: BigDecimal::from(amount),
                estimated_time: 10,
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
            items: vec![OrderLineItem {
                id: Uuid::new_v4(),
                order_id: id,
                position: 0,
                menu_item_id: item.to_lowercase(),
                name: item.to_string(),
                price: BigDecimal::from(amount),
                quantity: 1,
                subtotal: BigDecimal::from(amount),
                customizations: Customizations::default(),
                selected_options: SelectedOptions::default(),
                notes: None,
            }],
        }
    }

    #[test]
    fn test_filter_fields_combine_with_and_values_with_or() {
        let now = Utc::now();
        let pending = record("ORD-1", OrderStatus::Pending, OrderPriority::Normal, 20, now, "Pho");
        let ready = record("ORD-2", OrderStatus::Ready, OrderPriority::Normal, 80, now, "Ramen");

        let filter = OrderFilter {
            statuses: vec![OrderStatus::Pending, OrderStatus::Ready],
            min_amount: Some(BigDecimal::from(50)),
            ..Default::default()
        };
        assert!(!filter.matches(&pending));
        assert!(filter.matches(&ready));

        let search = OrderFilter {
            search: Some("  rAmEn ".to_string()),
            ..Default::default()
        };
        assert!(search.matches(&ready));
        assert!(!search.matches(&pending));
        assert!(OrderFilter::default().matches(&pending));
    }

    #[test]
    fn test_priority_sort_breaks_ties_by_creation_time() {
        let now = Utc::now();
        let mut records = vec![
            record("ORD-1", OrderStatus::Pending, OrderPriority::Normal, 10, now, "A"),
            record("ORD-2", OrderStatus::Pending, OrderPriority::Urgent, 10, now + Duration::seconds(5), "B"),
            record("ORD-3", OrderStatus::Pending, OrderPriority::Urgent, 10, now, "C"),
        ];

        OrderSort {
            field: SortField::Priority,
            direction: SortDirection::Desc,
        }
        .apply(&mut records);

        let numbers: Vec<_> = records.iter().map(|r| r.order.order_number.as_str()).collect();
        assert_eq!(numbers, ["ORD-3", "ORD-2", "ORD-1"]);
    }

    #[test]
    fn test_order_stats_exclude_cancelled_revenue() {
        let now = Utc::now();
        let records = vec![
            record("ORD-1", OrderStatus::Completed, OrderPriority::Normal, 30, now, "A"),
            record("ORD-2", OrderStatus::Pending, OrderPriority::Normal, 20, now, "B"),
            record("ORD-3", OrderStatus::Cancelled, OrderPriority::Normal, 100, now, "C"),
        ];

        let stats = order_stats(&records);
        assert_eq!(stats.total_orders, 3);
        assert_eq!(stats.by_status["cancelled"], 1);
        assert_eq!(stats.by_status["ready"], 0);
        assert_eq!(stats.revenue, BigDecimal::from(50));
        assert_eq!(stats.average_order_value, BigDecimal::from(25));
        assert_eq!(stats.average_estimated_time, 10.0);
    }

    #[test]
    fn test_empty_stats() {
        let stats = order_stats(&[]);
        assert_eq!(stats.average_order_value, BigDecimal::zero());
        assert_eq!(session_stats(&[]).average_devices, 0.0);
    }
}
