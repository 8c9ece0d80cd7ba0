//! Buyer-facing message templates, one per order event.

use domain::{Order, OrderEvent, OrderItem};

use crate::services::Notification;

/// Renders the message sent to the buyer when `event` fires for `order`.
pub fn render(event: OrderEvent, order: &Order, items: &[OrderItem]) -> Notification {
    let short_id = short_id(order);
    let (subject, intro) = match event {
        OrderEvent::Paid => (
            format!("Payment received for order {short_id}"),
            "We received your payment and are preparing your order.".to_string(),
        ),
        OrderEvent::Delivered => (
            format!("Your order {short_id} has been delivered"),
            "Your order is complete. Delivery details are listed below.".to_string(),
        ),
        OrderEvent::Failed => (
            format!("Problem with order {short_id}"),
            "We could not complete your order. Our team has been notified and will contact you."
                .to_string(),
        ),
    };

    let mut body = format!("Hi {},\n\n{intro}\n\n", order.customer_name);
    for item in items {
        body.push_str(&format!(
            "- {} x{} ({})\n",
            item.product_name, item.quantity, item.total_price
        ));
        if event == OrderEvent::Delivered {
            if let Some(data) = &item.delivery_data {
                body.push_str(&format!("  {}\n", delivery_line(data)));
            }
        }
    }
    body.push_str(&format!("\nTotal: {}\n", order.total_amount));

    Notification {
        to: order.customer_email.clone(),
        subject,
        body,
    }
}

fn short_id(order: &Order) -> String {
    order.id.to_string().chars().take(8).collect::<String>().to_uppercase()
}

/// One-line summary of an item's delivery data.
fn delivery_line(data: &serde_json::Value) -> String {
    match data.get("items").and_then(|v| v.as_array()) {
        Some(secrets) => secrets
            .iter()
            .filter_map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        None => data.to_string(),
    }
}
