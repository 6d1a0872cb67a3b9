//! DOM extraction for the case detail view.
//!
//! All scraping happens in one JS pass per concern: the page walks its own
//! DOM and hands back plain JSON, which deserializes into the raw record
//! types. Field labels arrive in whatever casing the portal uses that
//! week, so matching is lowercase and accent-tolerant where it matters.

use chromiumoxide::Page;
use serde::Deserialize;

use vigia_core::error::AppError;
use vigia_core::model::{RawBinnacle, RawNotification};

use crate::pool::classify_cdp;

const BINNACLES_JS: &str = r#"(() => {
    const text = (el) => {
        if (!el) return null;
        const value = el.textContent.trim();
        return value.length ? value : null;
    };

    const blocks = Array.from(
        document.querySelectorAll('#pnlSeguimientos .panel-seguimiento, #divSeguimientos .seguimiento'));

    return blocks.map((block, i) => {
        const fields = {};
        for (const row of block.querySelectorAll('.row, .fila')) {
            const label = text(row.querySelector('b, label, .etiqueta'));
            const value = text(row.querySelector('.col-md-8, .col-sm-8, .valor'));
            if (label) {
                fields[label.replace(/:\s*$/, '').toLowerCase()] = value;
            }
        }

        const link = block.querySelector("a[href*='descargaResolucion'], a.aDescarg");

        const notifications = Array.from(
            block.querySelectorAll('.panel-notificacion, .notificacion')).map((n) => {
            const nf = {};
            for (const row of n.querySelectorAll('.row, .fila')) {
                const label = text(row.querySelector('b, label, .etiqueta'));
                const value = text(row.querySelector('.col-md-8, .col-sm-8, .valor'));
                if (label) {
                    nf[label.replace(/:\s*$/, '').toLowerCase()] = value;
                }
            }
            return {
                code: text(n.querySelector('.panel-heading, .codigo')) || '',
                addressee: nf['destinatario'] || null,
                ship_date: nf['fecha de envío'] || nf['fecha de envio'] || null,
                attachments: nf['anexos'] || null,
                delivery_method: nf['forma de entrega'] || null,
                issued_at: nf['fecha de emisión'] || nf['fecha de emision'] || null,
                dispatched_at: nf['fecha de despacho'] || null,
                delivered_at: nf['fecha de entrega'] || null,
                returned_at: nf['fecha de devolución'] || nf['fecha de devolucion'] || null,
                received_at: nf['fecha de recepción'] || nf['fecha de recepcion'] || null,
                acknowledged_at: nf['fecha de cargo'] || null,
            };
        });

        return {
            index: i + 1,
            resolution_date: fields['fecha de resolución'] || fields['fecha de resolucion'] || null,
            entry_date: fields['fecha de ingreso'] || null,
            resolution: fields['resolución'] || fields['resolucion'] || null,
            notification_type: fields['tipo de notificación'] || fields['tipo de notificacion'] || null,
            acto: fields['acto'] || null,
            fojas: fields['fojas'] || null,
            folios: fields['folios'] || null,
            provedio_date: fields['proveído'] || fields['proveido'] || null,
            sumilla: fields['sumilla'] || null,
            user_description: fields['descripción de usuario'] || fields['descripcion de usuario'] || null,
            file_url: link ? link.href : null,
            notifications,
        };
    });
})()"#;

#[derive(Debug, Deserialize)]
struct ExtractedNotification {
    code: String,
    addressee: Option<String>,
    ship_date: Option<String>,
    attachments: Option<String>,
    delivery_method: Option<String>,
    issued_at: Option<String>,
    dispatched_at: Option<String>,
    delivered_at: Option<String>,
    returned_at: Option<String>,
    received_at: Option<String>,
    acknowledged_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractedBinnacle {
    index: u32,
    resolution_date: Option<String>,
    entry_date: Option<String>,
    resolution: Option<String>,
    notification_type: Option<String>,
    acto: Option<String>,
    fojas: Option<String>,
    folios: Option<String>,
    provedio_date: Option<String>,
    sumilla: Option<String>,
    user_description: Option<String>,
    file_url: Option<String>,
    notifications: Vec<ExtractedNotification>,
}

impl From<ExtractedNotification> for RawNotification {
    fn from(n: ExtractedNotification) -> Self {
        RawNotification {
            code: n.code,
            addressee: n.addressee,
            ship_date: n.ship_date,
            attachments: n.attachments,
            delivery_method: n.delivery_method,
            issued_at: n.issued_at,
            dispatched_at: n.dispatched_at,
            delivered_at: n.delivered_at,
            returned_at: n.returned_at,
            received_at: n.received_at,
            acknowledged_at: n.acknowledged_at,
        }
    }
}

impl From<ExtractedBinnacle> for RawBinnacle {
    fn from(b: ExtractedBinnacle) -> Self {
        RawBinnacle {
            index: b.index,
            resolution_date: b.resolution_date,
            entry_date: b.entry_date,
            resolution: b.resolution,
            notification_type: b.notification_type,
            acto: b.acto,
            fojas: b.fojas,
            folios: b.folios,
            provedio_date: b.provedio_date,
            sumilla: b.sumilla,
            user_description: b.user_description,
            notifications: b.notifications.into_iter().map(Into::into).collect(),
            file_url: b.file_url,
        }
    }
}

/// Extract the full timeline from the detail view, 1-based index order.
pub async fn binnacles(page: &Page) -> Result<Vec<RawBinnacle>, AppError> {
    let result = page.evaluate(BINNACLES_JS).await.map_err(classify_cdp)?;

    let extracted: Vec<ExtractedBinnacle> = result
        .into_value()
        .map_err(|e| AppError::ValidationFailed(format!("timeline extraction: {e}")))?;

    Ok(extracted.into_iter().map(Into::into).collect())
}

// -- Shared DOM helpers --

/// True when the selector matches at least one element.
pub(crate) async fn element_exists(page: &Page, selector: &str) -> Result<bool, AppError> {
    let js = format!(
        "document.querySelector({}) !== null",
        serde_json::to_string(selector)?
    );
    let result = page.evaluate(js).await.map_err(classify_cdp)?;
    Ok(result.into_value::<bool>().unwrap_or(false))
}

/// Read an input's current value; `None` when absent or empty.
pub(crate) async fn field_value(
    page: &Page,
    selector: &str,
) -> Result<Option<String>, AppError> {
    let js = format!(
        "(() => {{ const el = document.querySelector({}); return el ? el.value : null; }})()",
        serde_json::to_string(selector)?
    );
    let result = page.evaluate(js).await.map_err(classify_cdp)?;
    Ok(result
        .into_value::<Option<String>>()
        .unwrap_or(None)
        .filter(|v| !v.trim().is_empty()))
}

/// Set an input's value and fire the events portal scripts listen for.
pub(crate) async fn set_field_value(
    page: &Page,
    selector: &str,
    value: &str,
) -> Result<(), AppError> {
    let js = format!(
        r#"(() => {{
            const el = document.querySelector({sel});
            if (!el) return false;
            el.value = {val};
            el.dispatchEvent(new Event('input', {{ bubbles: true }}));
            el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return true;
        }})()"#,
        sel = serde_json::to_string(selector)?,
        val = serde_json::to_string(value)?,
    );
    page.evaluate(js).await.map_err(classify_cdp)?;
    Ok(())
}
