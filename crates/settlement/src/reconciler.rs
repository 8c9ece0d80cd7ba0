//! Payment reconciler: opens gateway charges and folds gateway status back
//! into local payment and order state.

use chrono::Utc;
use common::OrderId;
use domain::{
    ChargeDetails, Order, OrderStatus, Payment, PaymentSettlement, PaymentStatus, Settings,
    gateway_fee,
};
use ledger::{OrderStore, PaymentStore};

use crate::error::{Result, SettlementError};
use crate::machine::OrderStateMachine;
use crate::services::{ChargeRequest, PaymentGateway};

/// How many times `open_payment` re-reads after losing an insert race.
const OPEN_ATTEMPTS: usize = 3;

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// The order as stored after the pass.
    pub order: Order,
    /// The latest payment attempt as stored after the pass.
    pub payment: Option<Payment>,
    /// True only for the call whose conditional write moved the order to PAID.
    pub became_paid: bool,
}

/// Maps the gateway's status vocabulary onto payment statuses.
///
/// Unknown words are a permanent gateway error so nothing is written on a
/// response we cannot interpret.
pub fn map_gateway_status(status: &str) -> Result<PaymentStatus> {
    match status.trim().to_ascii_lowercase().as_str() {
        "paid" | "success" | "settled" | "completed" => Ok(PaymentStatus::Paid),
        "pending" | "unpaid" | "waiting" => Ok(PaymentStatus::Pending),
        "expired" => Ok(PaymentStatus::Expired),
        "failed" | "cancelled" | "canceled" => Ok(PaymentStatus::Failed),
        other => Err(SettlementError::permanent(
            "payment gateway",
            format!("unknown status {other:?}"),
        )),
    }
}

/// Opens and reconciles gateway payments for orders.
pub struct PaymentReconciler<L, G> {
    ledger: L,
    machine: OrderStateMachine<L>,
    gateway: G,
}

impl<L, G> PaymentReconciler<L, G>
where
    L: OrderStore + PaymentStore + Clone,
    G: PaymentGateway,
{
    pub fn new(ledger: L, gateway: G) -> Self {
        Self {
            machine: OrderStateMachine::new(ledger.clone()),
            ledger,
            gateway,
        }
    }

    /// Returns the order's open payment, opening a gateway charge if there
    /// is none.
    ///
    /// An unexpired PENDING attempt is returned unchanged with no gateway
    /// call. An expired one is moved to EXPIRED before a new attempt is
    /// opened. A gateway failure marks the new attempt FAILED and is
    /// returned to the caller.
    #[tracing::instrument(skip(self, settings))]
    pub async fn open_payment(&self, order_id: OrderId, settings: &Settings) -> Result<Payment> {
        let order = self.machine.load(order_id).await?;
        if order.status != OrderStatus::AwaitingPayment {
            return Err(SettlementError::Validation(format!(
                "order {order_id} is {}, not awaiting payment",
                order.status
            )));
        }
        if !order.total_amount.is_positive() {
            return Err(SettlementError::Validation(format!(
                "order {order_id} has nothing to charge"
            )));
        }

        for _ in 0..OPEN_ATTEMPTS {
            let now = Utc::now();

            if let Some(existing) = self.ledger.pending_payment(order_id).await? {
                if existing.is_open(now) {
                    tracing::debug!(ref_id = %existing.ref_id, "reusing open payment");
                    return Ok(existing);
                }
                self.settle(&existing, PaymentStatus::Expired, None).await?;
                continue;
            }

            let payment = Payment::pending(
                order_id,
                order.total_amount,
                settings.payment_expiry_fallback,
                now,
            );
            if !self.ledger.insert_payment(&payment).await? {
                // another caller opened one first; read theirs
                continue;
            }

            return self.charge(&order, payment).await;
        }

        Err(SettlementError::InvariantViolation(format!(
            "could not open a payment for order {order_id}"
        )))
    }

    async fn charge(&self, order: &Order, payment: Payment) -> Result<Payment> {
        let request = ChargeRequest {
            ref_id: payment.ref_id.clone(),
            amount: payment.amount,
            customer_email: order.customer_email.clone(),
            customer_name: order.customer_name.clone(),
        };

        let charge = match self.gateway.create_charge(&request).await {
            Ok(charge) => charge,
            Err(e) => {
                tracing::warn!(ref_id = %payment.ref_id, error = %e, "gateway charge failed");
                self.settle(&payment, PaymentStatus::Failed, None).await?;
                return Err(e);
            }
        };

        let details = ChargeDetails {
            external_trx_id: charge.external_trx_id,
            qr_link: charge.qr_link,
            pay_url: charge.pay_url,
            expires_at: charge.expires_at.unwrap_or(payment.expires_at),
        };
        self.ledger
            .attach_charge(payment.id, &details, Utc::now())
            .await?;

        metrics::counter!("payments_opened_total").increment(1);
        tracing::info!(order_id = %order.id, ref_id = %payment.ref_id, "payment opened");

        self.ledger
            .get_payment(payment.id)
            .await?
            .ok_or_else(|| SettlementError::PaymentNotFound(payment.ref_id.clone()))
    }

    /// Resolves the order's latest payment against the gateway.
    ///
    /// A settled order, or a latest attempt that is no longer PENDING, is
    /// answered from the ledger with no gateway call. A gateway failure is
    /// returned before anything is written. An order with nothing to
    /// charge moves to PAID without a payment.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, order_id: OrderId) -> Result<ReconcileOutcome> {
        let order = self.machine.load(order_id).await?;
        if order.status.is_settled() {
            return self.cached(order, false).await;
        }
        if order.total_amount.is_zero() {
            // fully discounted: nothing to collect
            let became_paid = self.mark_order_paid(order_id).await?;
            return self.reload(order_id, became_paid).await;
        }

        let Some(payment) = self.ledger.latest_payment(order_id).await? else {
            return self.cached(order, false).await;
        };

        if payment.status == PaymentStatus::Paid {
            // payment settled by a pass that stopped before the order moved
            let became_paid = self.mark_order_paid(order_id).await?;
            return self.reload(order_id, became_paid).await;
        }
        if payment.status != PaymentStatus::Pending || !payment.has_charge() {
            return self.cached(order, false).await;
        }

        metrics::counter!("reconcile_gateway_calls_total").increment(1);
        let report = self.gateway.query_status(&payment.ref_id).await?;
        let mapped = map_gateway_status(&report.status)?;
        let now = Utc::now();

        let mut became_paid = false;
        match mapped {
            PaymentStatus::Pending => {
                if payment.expires_at <= now {
                    self.settle(&payment, PaymentStatus::Expired, None).await?;
                }
            }
            PaymentStatus::Paid => {
                let charged = report.amount_charged.unwrap_or(payment.amount);
                if charged < payment.amount {
                    return Err(SettlementError::InvariantViolation(format!(
                        "gateway reports {charged} paid for {} owed on {}",
                        payment.amount, payment.ref_id
                    )));
                }
                let settled = report.amount_settled.unwrap_or(charged);
                let settlement = PaymentSettlement {
                    status: PaymentStatus::Paid,
                    external_trx_id: report.external_trx_id,
                    fee: gateway_fee(charged, settled),
                    net_amount: settled,
                    paid_at: Some(now),
                };
                self.ledger
                    .settle_payment(payment.id, &settlement, now)
                    .await?;
                became_paid = self.mark_order_paid(order_id).await?;
            }
            status => {
                self.settle(&payment, status, report.external_trx_id).await?;
            }
        }

        self.reload(order_id, became_paid).await
    }

    async fn mark_order_paid(&self, order_id: OrderId) -> Result<bool> {
        self.machine
            .transition(order_id, OrderStatus::AwaitingPayment, OrderStatus::Paid)
            .await
    }

    /// Moves a PENDING attempt to a non-paid terminal status.
    async fn settle(
        &self,
        payment: &Payment,
        status: PaymentStatus,
        external_trx_id: Option<String>,
    ) -> Result<bool> {
        let settlement = PaymentSettlement {
            status,
            external_trx_id,
            fee: payment.fee,
            net_amount: payment.net_amount,
            paid_at: None,
        };
        let applied = self
            .ledger
            .settle_payment(payment.id, &settlement, Utc::now())
            .await?;
        if applied {
            tracing::info!(ref_id = %payment.ref_id, status = %status, "payment settled");
        }
        Ok(applied)
    }

    async fn cached(&self, order: Order, became_paid: bool) -> Result<ReconcileOutcome> {
        let payment = self.ledger.latest_payment(order.id).await?;
        Ok(ReconcileOutcome {
            order,
            payment,
            became_paid,
        })
    }

    async fn reload(&self, order_id: OrderId, became_paid: bool) -> Result<ReconcileOutcome> {
        let order = self.machine.load(order_id).await?;
        self.cached(order, became_paid).await
    }
}
