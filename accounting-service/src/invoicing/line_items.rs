//! Line item factories.
//!
//! Pure calculations: callers fetch usage first and pass it in.

use crate::error::{AccountingError, InvoiceError, Result};
use crate::models::{FeatureRate, FeatureType, LineItem, ProductRate, SmsBillable};
use chrono::{Datelike, Duration, NaiveDate};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Inclusive date range an invoice covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
}

impl BillingPeriod {
    pub fn new(date_start: NaiveDate, date_end: NaiveDate) -> Result<Self> {
        if date_start > date_end {
            return Err(InvoiceError::InvalidPeriod {
                start: date_start,
                end: date_end,
            }
            .into());
        }
        Ok(Self {
            date_start,
            date_end,
        })
    }

    /// The calendar month before the one containing `today`.
    pub fn previous_month(today: NaiveDate) -> Self {
        let date_end = today - Duration::days(i64::from(today.day()));
        let date_start = date_end - Duration::days(i64::from(date_end.day()) - 1);
        Self {
            date_start,
            date_end,
        }
    }

    /// Days in the month the period ends in.
    pub fn days_in_month(&self) -> u32 {
        days_in_month(self.date_end)
    }

    pub fn is_prorated(&self) -> bool {
        !(self.date_end.day() == self.days_in_month() && self.date_start.day() == 1)
    }

    pub fn num_prorated_days(&self) -> i64 {
        i64::from(self.date_end.day()) - i64::from(self.date_start.day()) + 1
    }
}

pub fn days_in_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.pred_opt())
        .map_or(31, |last| last.day())
}

/// Round to cents, halves to even.
pub fn round2(amount: Decimal) -> Decimal {
    amount.round_dp(2)
}

fn plural(count: i64, one: &str, many: &str) -> String {
    if count == 1 {
        one.to_string()
    } else {
        many.to_string()
    }
}

fn to_quantity(value: i64) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| AccountingError::LineItem(format!("quantity {} out of range", value)))
}

fn feature_line(invoice_id: Uuid, rate: &FeatureRate, feature_type: FeatureType) -> LineItem {
    LineItem {
        line_item_id: Uuid::new_v4(),
        invoice_id,
        product_rate_id: None,
        feature_rate_id: Some(rate.rate_id),
        feature_type: Some(feature_type.as_str().to_string()),
        base_description: None,
        base_cost: Decimal::ZERO,
        unit_description: None,
        unit_cost: Decimal::ZERO,
        quantity: 0,
        applied_credit: Decimal::ZERO,
    }
}

/// Monthly fee, or a per-day share of it for a partial month.
pub fn product_line_item(
    invoice_id: Uuid,
    rate: &ProductRate,
    plan_name: &str,
    period: &BillingPeriod,
) -> Result<LineItem> {
    let mut item = LineItem {
        line_item_id: Uuid::new_v4(),
        invoice_id,
        product_rate_id: Some(rate.rate_id),
        feature_rate_id: None,
        feature_type: None,
        base_description: None,
        base_cost: Decimal::ZERO,
        unit_description: None,
        unit_cost: Decimal::ZERO,
        quantity: 1,
        applied_credit: Decimal::ZERO,
    };

    if period.is_prorated() {
        let days = period.num_prorated_days();
        item.unit_cost = round2(rate.monthly_fee / Decimal::from(period.days_in_month()));
        item.quantity = to_quantity(days)?;
        item.unit_description = Some(format!(
            "{} {} of {} Software Plan.",
            days,
            plural(days, "day", "days"),
            plan_name
        ));
    } else {
        item.base_cost = rate.monthly_fee;
        item.base_description = Some(format!("One month of {} Software Plan.", plan_name));
    }
    Ok(item)
}

/// Per-user fee for active users above the monthly limit.
pub fn user_line_item(
    invoice_id: Uuid,
    rate: &FeatureRate,
    active_users: i64,
    period: &BillingPeriod,
) -> Result<LineItem> {
    let mut item = feature_line(invoice_id, rate, FeatureType::User);

    item.unit_cost = if period.is_prorated() {
        round2(
            rate.per_excess_fee * Decimal::from(period.num_prorated_days())
                / Decimal::from(period.days_in_month()),
        )
    } else {
        rate.per_excess_fee
    };

    let excess = if rate.is_unlimited() {
        0
    } else {
        (active_users - i64::from(rate.monthly_limit)).max(0)
    };
    item.quantity = to_quantity(excess)?;

    if excess > 0 {
        let limit = i64::from(rate.monthly_limit);
        item.unit_description = Some(format!(
            "Per User fee exceeding monthly limit of {} {}.",
            limit,
            plural(limit, "user", "users")
        ));
    }
    Ok(item)
}

/// Overage charge for SMS parts beyond the monthly limit. `billables` must
/// be ordered newest first; the newest parts fill the free allowance.
pub fn sms_line_item(
    invoice_id: Uuid,
    rate: &FeatureRate,
    billables: &[SmsBillable],
) -> Result<LineItem> {
    let mut item = feature_line(invoice_id, rate, FeatureType::Sms);
    item.quantity = 1;

    let num_sms: i64 = billables.iter().map(|b| i64::from(b.multipart_count)).sum();
    let limit = i64::from(rate.monthly_limit);
    let within_limit = rate.is_unlimited() || num_sms <= limit;

    if !within_limit {
        let mut total_excess = Decimal::ZERO;
        let mut sms_count: i64 = 0;
        for billable in billables {
            let parts = i64::from(billable.multipart_count);
            sms_count += parts;
            if sms_count <= limit {
                continue;
            }
            let parts_over_limit = sms_count - limit;
            if parts_over_limit >= parts {
                total_excess += billable.total_charge();
            } else {
                total_excess += billable.total_charge() * Decimal::from(parts_over_limit)
                    / Decimal::from(parts);
            }
        }
        item.unit_cost = round2(total_excess);
    }

    item.unit_description = Some(if rate.is_unlimited() {
        format!("{} {}", num_sms, plural(num_sms, "SMS Message", "SMS Messages"))
    } else if within_limit {
        format!("{} of {} included SMS messages", num_sms, limit)
    } else {
        let extra = num_sms - limit;
        format!(
            "{} {} beyond {} messages included.",
            extra,
            plural(extra, "SMS Message", "SMS Messages"),
            limit
        )
    });
    Ok(item)
}
