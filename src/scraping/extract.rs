//! Field extraction from the rendered "Consulta RUC" result page.
//!
//! The page is a stack of `.list-group-item` rows where each label is an
//! `<h4>` and its value is the next `<p>` in document order (the RUC row is
//! the exception: its value is the next `<h4>`). Extraction is best-effort
//! per field and strict per page: a missing label yields the "not found"
//! marker, but a page without the RUC heading is rejected outright.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::core::error::ExtractError;
use crate::core::types::{LookupKey, RecordBuilder, RecordField, TaxpayerRecord};

/// Heading that carries "<RUC> - <legal name>" in the following `<h4>`.
const RUC_LABEL: &str = "Número de RUC:";
/// Heading followed by the economic-activities table.
const ACTIVITIES_LABEL: &str = "Actividad(es) Económica(s):";
/// Marks the primary row of the activities table.
const PRIMARY_ACTIVITY_TAG: &str = "Principal";

/// Labels for the simple `<h4>` → `<p>` fields. Alternatives cover the small
/// wording changes the portal has shipped over time.
const PARAGRAPH_FIELDS: &[(RecordField, &[&str])] = &[
    (RecordField::TaxpayerType, &["Tipo Contribuyente:", "Tipo de Contribuyente:"]),
    (RecordField::TradeName, &["Nombre Comercial:"]),
    (RecordField::RegistrationDate, &["Fecha de Inscripción:"]),
    (RecordField::ActivityStartDate, &["Fecha de Inicio de Actividades:"]),
    (RecordField::TaxpayerStatus, &["Estado del Contribuyente:"]),
    (RecordField::TaxpayerCondition, &["Condición del Contribuyente:"]),
    (RecordField::FiscalAddress, &["Domicilio Fiscal:"]),
    (
        RecordField::InvoicingSystem,
        &["Sistema Emisión de Comprobante:", "Sistema de Emisión de Comprobante:"],
    ),
    (
        RecordField::ForeignTradeActivity,
        &["Actividad Comercio Exterior:", "Actividad de Comercio Exterior:"],
    ),
    (
        RecordField::AccountingSystem,
        &["Sistema Contabilidad:", "Sistema de Contabilidad:"],
    ),
];

/// Phrases the portal uses when a well-formed RUC is not registered (accent-folded).
const NO_TAXPAYER_PATTERNS: &[&str] = &[
    "no existe",
    "no se encontr",
    "no registra",
    "no es valido",
    "no hay resultados",
];

/// Signatures of pages that are not a portal answer at all (accent-folded).
const CHALLENGE_PATTERNS: &[&str] = &[
    "captcha",
    "codigo de verificacion",
    "en mantenimiento",
    "servicio no disponible",
    "service unavailable",
    "request rejected",
    "access denied",
];

static NO_TAXPAYER_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
static CHALLENGE_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();
static WHITESPACE: OnceLock<Regex> = OnceLock::new();

fn matcher<'a>(cell: &'a OnceLock<AhoCorasick>, patterns: &[&str]) -> &'a AhoCorasick {
    cell.get_or_init(|| {
        AhoCorasickBuilder::new()
            .ascii_case_insensitive(true)
            .build(patterns)
            .expect("valid literal patterns")
    })
}

fn whitespace() -> &'static Regex {
    WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// Collapse every whitespace run (including `&nbsp;`) to one space and trim.
pub fn normalize_text(s: &str) -> String {
    whitespace()
        .replace_all(&s.replace('\u{a0}', " "), " ")
        .trim()
        .to_string()
}

/// Lower-case and strip Spanish diacritics so label matching survives
/// encoding and accent drift.
fn fold(s: &str) -> String {
    normalize_text(s)
        .chars()
        .map(|c| match c {
            'á' | 'Á' => 'a',
            'é' | 'É' => 'e',
            'í' | 'Í' => 'i',
            'ó' | 'Ó' => 'o',
            'ú' | 'Ú' | 'ü' | 'Ü' => 'u',
            'ñ' | 'Ñ' => 'n',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

fn element_text(el: ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<String>())
}

/// A parsed result page with its elements flattened in document order, which
/// is what "the next `<p>` after this label" means.
struct ResultPage {
    document: Html,
}

impl ResultPage {
    fn parse(html: &str) -> Self {
        Self {
            document: Html::parse_document(html),
        }
    }

    fn elements(&self) -> Vec<ElementRef<'_>> {
        self.document
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .collect()
    }

    fn has(&self, selector: &str) -> bool {
        Selector::parse(selector)
            .map(|sel| self.document.select(&sel).next().is_some())
            .unwrap_or(false)
    }

    fn body_text(&self) -> String {
        fold(&self.document.root_element().text().collect::<String>())
    }

    /// Index of the first `<h4>` whose text starts with any of `labels`.
    fn label_index(elements: &[ElementRef<'_>], labels: &[&str]) -> Option<usize> {
        let wanted: Vec<String> = labels.iter().map(|l| fold(l)).collect();
        elements.iter().position(|el| {
            if el.value().name() != "h4" {
                return false;
            }
            let text = fold(&el.text().collect::<String>());
            wanted.iter().any(|w| text.starts_with(w.as_str()))
        })
    }

    /// First element named `tag` after `from` in document order, skipping
    /// the label's own descendants. Unless `tag` is itself `h4`, the search
    /// ends at the next `<h4>`: a label with no value row yields `None`
    /// rather than the following field's value.
    fn next_after<'a>(
        elements: &[ElementRef<'a>],
        from: usize,
        tag: &str,
    ) -> Option<ElementRef<'a>> {
        let label = elements[from];
        for el in elements[from + 1..]
            .iter()
            .filter(|el| !el.ancestors().any(|a| a.id() == label.id()))
        {
            let name = el.value().name();
            if name == tag {
                return Some(*el);
            }
            if name == "h4" {
                return None;
            }
        }
        None
    }
}

/// Extract the full taxpayer record for `key` from a rendered result page.
///
/// Fails with `MalformedPage` only when the page as a whole is unrecognizable,
/// and with `NoSuchTaxpayer` when the portal says the RUC is not registered.
pub fn extract_record(html: &str, key: &LookupKey) -> Result<TaxpayerRecord, ExtractError> {
    let page = ResultPage::parse(html);
    let elements = page.elements();

    let Some(ruc_idx) = ResultPage::label_index(&elements, &[RUC_LABEL]) else {
        return Err(classify_unrecognized(&page, key));
    };

    let mut builder = RecordBuilder::new();

    // A following label (text ending in ':') means the value row is absent.
    let heading = ResultPage::next_after(&elements, ruc_idx, "h4")
        .map(element_text)
        .filter(|text| !text.ends_with(':'));
    match heading {
        Some(text) => {
            let (ruc, legal_name) = match text.split_once(" - ") {
                Some((ruc, name)) => (ruc.trim().to_string(), name.trim().to_string()),
                None => (text.clone(), String::new()),
            };
            if !ruc.is_empty() && ruc != key.as_str() {
                warn!("Portal answered RUC {} for lookup {}", ruc, key);
                return Err(ExtractError::MalformedPage(format!(
                    "result is for RUC {} instead of {}",
                    ruc, key
                )));
            }
            builder.set(RecordField::Identifier, ruc);
            builder.set(RecordField::LegalName, legal_name);
        }
        None => warn!("RUC label present but its value is missing"),
    }

    for (field, labels) in PARAGRAPH_FIELDS {
        let value = ResultPage::label_index(&elements, labels)
            .and_then(|idx| ResultPage::next_after(&elements, idx, "p"))
            .map(element_text);
        match value {
            Some(v) => {
                builder.set(*field, v);
            }
            None => debug!("Label not found for field '{}'", field.key()),
        }
    }

    if let Some(activity) = primary_activity(&elements) {
        builder.set(RecordField::PrimaryActivity, activity);
    }

    let record = builder.build();
    let missing = record.missing_fields();
    if missing.is_empty() {
        info!("✅ Extracted all fields for RUC {}", key);
    } else {
        warn!(
            "Extracted RUC {} with {} missing field(s): {:?}",
            key,
            missing.len(),
            missing.iter().map(|f| f.key()).collect::<Vec<_>>()
        );
    }
    Ok(record)
}

/// Last " - " segment of the activities-table row tagged "Principal".
fn primary_activity(elements: &[ElementRef<'_>]) -> Option<String> {
    let idx = ResultPage::label_index(elements, &[ACTIVITIES_LABEL])?;
    let table = ResultPage::next_after(elements, idx, "table")?;
    let row_sel = Selector::parse("tr").ok()?;
    table
        .select(&row_sel)
        .map(element_text)
        .find(|row| row.contains(PRIMARY_ACTIVITY_TAG))
        .and_then(|row| row.rsplit(" - ").next().map(|s| s.trim().to_string()))
}

fn classify_unrecognized(page: &ResultPage, key: &LookupKey) -> ExtractError {
    let text = page.body_text();
    if matcher(&CHALLENGE_MATCHER, CHALLENGE_PATTERNS).is_match(&text) {
        warn!("Result page looks like a challenge/maintenance page");
        return ExtractError::MalformedPage("challenge or maintenance page".into());
    }
    if matcher(&NO_TAXPAYER_MATCHER, NO_TAXPAYER_PATTERNS).is_match(&text) {
        info!("Portal reports no taxpayer for RUC {}", key);
        return ExtractError::NoSuchTaxpayer(key.to_string());
    }
    let detail = if page.has(".list-group") {
        "result container present but RUC heading missing"
    } else {
        "no result container or RUC heading"
    };
    ExtractError::MalformedPage(detail.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LookupKey {
        LookupKey::parse("20106897914").unwrap()
    }

    #[test]
    fn normalize_collapses_whitespace_and_nbsp() {
        assert_eq!(
            normalize_text("  AV. COLON\n\t  NRO. 1\u{a0} LIMA  "),
            "AV. COLON NRO. 1 LIMA"
        );
    }

    #[test]
    fn fold_strips_accents_and_case() {
        assert_eq!(fold("Fecha de Inscripción:"), "fecha de inscripcion:");
        assert_eq!(fold("NÚMERO  de RUC:"), "numero de ruc:");
    }

    #[test]
    fn heading_without_separator_keeps_identifier() {
        let html = r#"<div class="list-group"><h4>Número de RUC:</h4><h4>20106897914</h4></div>"#;
        let record = extract_record(html, &key()).unwrap();
        assert_eq!(record.get(RecordField::Identifier), "20106897914");
        assert!(record.is_missing(RecordField::LegalName));
    }

    #[test]
    fn missing_ruc_value_does_not_borrow_next_label() {
        let html = r#"<div class="list-group">
            <h4>Número de RUC:</h4>
            <h4>Tipo Contribuyente:</h4><p>SOCIEDAD ANONIMA</p>
        </div>"#;
        let record = extract_record(html, &key()).unwrap();
        assert!(record.is_missing(RecordField::Identifier));
        assert_eq!(record.get(RecordField::TaxpayerType), "SOCIEDAD ANONIMA");
    }

    #[test]
    fn empty_value_row_does_not_borrow_next_field() {
        let html = r#"<div class="list-group">
            <div class="list-group-item"><h4>Número de RUC:</h4><h4>20106897914 - ENTEL PERU S.A.</h4></div>
            <div class="list-group-item"><h4>Nombre Comercial:</h4></div>
            <div class="list-group-item"><h4>Fecha de Inscripción:</h4><p>02/01/1993</p></div>
            <div class="list-group-item"><h4>Domicilio Fiscal:</h4><p>  </p></div>
            <div class="list-group-item"><h4>Actividad(es) Económica(s):</h4></div>
            <div class="list-group-item"><h4>Comprobantes de Pago:</h4>
                <table><tr><td>Principal - 0000 - NO ES UNA ACTIVIDAD</td></tr></table>
            </div>
        </div>"#;
        let record = extract_record(html, &key()).unwrap();
        assert!(record.is_missing(RecordField::TradeName));
        assert_eq!(record.get(RecordField::RegistrationDate), "02/01/1993");
        assert!(record.is_missing(RecordField::FiscalAddress));
        assert!(record.is_missing(RecordField::PrimaryActivity));
    }

    #[test]
    fn labels_in_any_order_yield_fixed_layout() {
        let html = r#"<div class="list-group">
            <h4>Actividad(es) Económica(s):</h4>
            <table>
                <tr><td>Secundaria 1 - 4741 - VENTA AL POR MENOR</td></tr>
                <tr><td>Principal - 6120 - TELECOMUNICACIONES INALÁMBRICAS</td></tr>
            </table>
            <h4>Estado del Contribuyente:</h4><p>ACTIVO</p>
            <h4>Sistema Contabilidad:</h4><p>COMPUTARIZADO</p>
            <h4>Tipo Contribuyente:</h4><p>SOCIEDAD ANONIMA</p>
            <h4>Número de RUC:</h4><h4>20106897914 - ENTEL PERU S.A.</h4>
            <h4>Condición del Contribuyente:</h4><p>HABIDO</p>
        </div>"#;
        let record = extract_record(html, &key()).unwrap();

        assert_eq!(record.get(RecordField::PrimaryActivity), "TELECOMUNICACIONES INALÁMBRICAS");
        assert_eq!(record.get(RecordField::TaxpayerStatus), "ACTIVO");
        assert_eq!(record.get(RecordField::AccountingSystem), "COMPUTARIZADO");
        assert_eq!(record.get(RecordField::TaxpayerType), "SOCIEDAD ANONIMA");
        assert_eq!(record.get(RecordField::LegalName), "ENTEL PERU S.A.");
        assert_eq!(record.get(RecordField::TaxpayerCondition), "HABIDO");

        let keys: Vec<&str> = record.iter().map(|(f, _)| f.key()).collect();
        let expected: Vec<&str> = RecordField::ALL.iter().map(|f| f.key()).collect();
        assert_eq!(keys, expected);

        let json = serde_json::to_string(&record).unwrap();
        let positions: Vec<usize> = expected
            .iter()
            .map(|k| json.find(&format!("\"{}\":", k)).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{}", json);
    }

    #[test]
    fn mismatched_ruc_is_rejected() {
        let html = r#"<div class="list-group"><h4>Número de RUC:</h4><h4>20100039207 - OTRA S.A.</h4></div>"#;
        assert!(matches!(
            extract_record(html, &key()),
            Err(ExtractError::MalformedPage(_))
        ));
    }

    #[test]
    fn not_registered_message_is_not_found() {
        let html = r#"<div class="list-group"><p>El número de RUC 20106897914 no existe.</p></div>"#;
        assert!(matches!(
            extract_record(html, &key()),
            Err(ExtractError::NoSuchTaxpayer(_))
        ));
    }

    #[test]
    fn captcha_page_is_malformed() {
        let html = r#"<html><body><p>Ingrese el código de verificación (CAPTCHA)</p></body></html>"#;
        assert!(matches!(
            extract_record(html, &key()),
            Err(ExtractError::MalformedPage(_))
        ));
    }
}
