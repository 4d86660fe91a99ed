use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::{
    NewOutbox, Order, OrderLineItem, OrderPriority, OrderStatus, PaymentStatus, SessionDevice,
    TableSession,
};
use crate::{ORDER_EVENT_TOPIC, SESSION_EVENT_TOPIC};

/// An event that is relayed to Kafka through the outbox table.
pub trait DomainEvent: Serialize {
    const TOPIC: &'static str;

    fn key(&self) -> String;

    fn to_outbox(&self) -> Result<NewOutbox, serde_json::Error> {
        Ok(NewOutbox {
            topic: Self::TOPIC.to_string(),
            key: self.key(),
            value: serde_json::to_vec(self)?,
        })
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        session_id: Uuid,
        table_number: i32,
        start_time: DateTime<Utc>,
        expiry_time: DateTime<Utc>,
    },
    DeviceJoined {
        session_id: Uuid,
        fingerprint: String,
        total_devices: i32,
    },
    SessionExpired {
        session_id: Uuid,
        table_number: i32,
    },
    SessionClosed {
        session_id: Uuid,
        table_number: i32,
        closed_by: Option<String>,
        reason: Option<String>,
    },
    SessionExtended {
        session_id: Uuid,
        expiry_time: DateTime<Utc>,
    },
    SessionFlagged {
        session_id: Uuid,
        reason: String,
        manual: bool,
    },
    SessionUnflagged {
        session_id: Uuid,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            SessionEvent::SessionStarted { session_id, .. }
            | SessionEvent::DeviceJoined { session_id, .. }
            | SessionEvent::SessionExpired { session_id, .. }
            | SessionEvent::SessionClosed { session_id, .. }
            | SessionEvent::SessionExtended { session_id, .. }
            | SessionEvent::SessionFlagged { session_id, .. }
            | SessionEvent::SessionUnflagged { session_id } => *session_id,
        }
    }

    pub fn started(session: &TableSession) -> Self {
        SessionEvent::SessionStarted {
            session_id: session.id,
            table_number: session.table_number,
            start_time: session.start_time,
            expiry_time: session.expiry_time,
        }
    }

    pub fn device_joined(session: &TableSession, device: &SessionDevice) -> Self {
        SessionEvent::DeviceJoined {
            session_id: session.id,
            fingerprint: device.fingerprint.clone(),
            total_devices: session.total_devices,
        }
    }

    pub fn expired(session: &TableSession) -> Self {
        SessionEvent::SessionExpired {
            session_id: session.id,
            table_number: session.table_number,
        }
    }

    pub fn closed(session: &TableSession) -> Self {
        SessionEvent::SessionClosed {
            session_id: session.id,
            table_number: session.table_number,
            closed_by: session.closed_by.clone(),
            reason: session.close_reason.clone(),
        }
    }

    pub fn extended(session: &TableSession) -> Self {
        SessionEvent::SessionExtended {
            session_id: session.id,
            expiry_time: session.expiry_time,
        }
    }
}

impl DomainEvent for SessionEvent {
    const TOPIC: &'static str = SESSION_EVENT_TOPIC;

    fn key(&self) -> String {
        self.session_id().to_string()
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct EventLineItem {
    pub menu_item_id: String,
    pub name: String,
    pub quantity: i32,
    pub notes: Option<String>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        table_number: i32,
        session_id: Option<Uuid>,
        total_amount: BigDecimal,
        estimated_time: i32,
        line_items: Vec<EventLineItem>,
    },
    OrderStatusChanged {
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        table_number: i32,
    },
    OrderPaymentUpdated {
        order_id: Uuid,
        payment_status: PaymentStatus,
        status: OrderStatus,
    },
    OrderUpdated {
        order_id: Uuid,
        priority: OrderPriority,
        assigned_staff: Option<String>,
        notes: Option<String>,
    },
}

impl OrderEvent {
    pub fn order_id(&self) -> Uuid {
        match self {
            OrderEvent::OrderCreated { order_id, .. }
            | OrderEvent::OrderStatusChanged { order_id, .. }
            | OrderEvent::OrderPaymentUpdated { order_id, .. }
            | OrderEvent::OrderUpdated { order_id, .. } => *order_id,
        }
    }

    pub fn created(order: &Order, line_items: &[OrderLineItem]) -> Self {
        OrderEvent::OrderCreated {
            order_id: order.id,
            order_number: order.order_number.clone(),
            table_number: order.table_number,
            session_id: order.session_id,
            total_amount: order.total_amount.clone(),
            estimated_time: order.estimated_time,
            line_items: line_items
                .iter()
                .map(|i| EventLineItem {
                    menu_item_id: i.menu_item_id.clone(),
                    name: i.name.clone(),
                    quantity: i.quantity,
                    notes: i.notes.clone(),
                })
                .collect(),
        }
    }

    pub fn status_changed(order: &Order, from: OrderStatus) -> Self {
        OrderEvent::OrderStatusChanged {
            order_id: order.id,
            from,
            to: order.status,
            table_number: order.table_number,
        }
    }

    pub fn payment_updated(order: &Order) -> Self {
        OrderEvent::OrderPaymentUpdated {
            order_id: order.id,
            payment_status: order.payment_status,
            status: order.status,
        }
    }

    pub fn updated(order: &Order) -> Self {
        OrderEvent::OrderUpdated {
            order_id: order.id,
            priority: order.priority,
            assigned_staff: order.assigned_staff.clone(),
            notes: order.notes.clone(),
        }
    }
}

impl DomainEvent for OrderEvent {
    const TOPIC: &'static str = ORDER_EVENT_TOPIC;

    fn key(&self) -> String {
        self.order_id().to_string()
    }
}
