//! Read-only export views. These routes are public: they carry no secrets
//! and exist so scorekeepers can pull the log into other tools.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Path;
use axum::http::{header, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use matchlog_crdt::Envelope;
use matchlog_primitives::{Incident, MatchRef, SkillsKind};

use crate::error::{ApiError, ApiResponse};
use crate::ServiceState;

/// `GET /:sku/json` — the resolved incident list as JSON.
pub async fn json(
    Extension(state): Extension<Arc<ServiceState>>,
    Path(sku): Path<String>,
) -> Result<ApiResponse<Vec<Incident>>, ApiError> {
    let instance = state.instance(&sku).await?;
    let incidents = instance.incidents().await;

    let mut rows: Vec<Incident> = incidents
        .values
        .into_values()
        .map(|envelope| envelope.value)
        .collect();
    rows.sort_by(|a, b| a.time.cmp(&b.time));

    Ok(ApiResponse { payload: rows })
}

/// `GET /:sku/csv` — one row per incident.
pub async fn csv(
    Extension(state): Extension<Arc<ServiceState>>,
    Path(sku): Path<String>,
) -> Result<Response<Body>, ApiError> {
    let instance = state.instance(&sku).await?;
    let incidents = instance.incidents().await;

    let mut envelopes: Vec<Envelope<Incident>> = incidents.values.into_values().collect();
    envelopes.sort_by(|a, b| a.value.time.cmp(&b.value.time));

    let mut out = String::from("Date,Time,ID,SKU,Division,Match,Team,Outcome,Rules,Notes\n");
    for envelope in &envelopes {
        out.push_str(&csv_row(&envelope.value));
        out.push('\n');
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/csv; charset=utf-8")
        .body(Body::from(out))
        .map_err(|_| ApiError::server_error("csv response"))
}

fn csv_row(incident: &Incident) -> String {
    let (division, match_name) = match &incident.match_ref {
        Some(MatchRef::Match { division, name, .. }) => (division.to_string(), name.clone()),
        Some(MatchRef::Skills {
            skills_type,
            attempt,
        }) => {
            let kind = match skills_type {
                SkillsKind::Programming => "Auto",
                SkillsKind::Driver => "Driver",
            };
            (String::new(), format!("{kind} Skills {attempt}"))
        }
        None => (String::new(), String::new()),
    };

    let notes: String = incident
        .notes
        .chars()
        .map(|c| if matches!(c, '\r' | '\n' | '\t') { ' ' } else { c })
        .collect();

    [
        incident.time.format("%Y-%m-%d").to_string(),
        incident.time.format("%H:%M:%S").to_string(),
        incident.id.to_string(),
        incident.sku.clone(),
        division,
        match_name,
        incident.team.clone(),
        format!("{:?}", incident.outcome),
        incident.rules.join(" "),
        notes,
    ]
    .map(|field| csv_escape(&field))
    .join(",")
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chrono::Utc;
    use matchlog_primitives::{IncidentId, Outcome};

    use super::*;

    #[test]
    fn csv_row_for_skills_attempt() {
        let incident = Incident {
            id: IncidentId::from("i1".to_owned()),
            sku: "RE-V5RC-25-0000".to_owned(),
            team: "1234A".to_owned(),
            match_ref: Some(MatchRef::Skills {
                skills_type: SkillsKind::Programming,
                attempt: 2,
            }),
            outcome: Outcome::Major,
            rules: vec!["<SG1>".to_owned(), "<SG2>".to_owned()],
            notes: "line one\nline two".to_owned(),
            time: Utc.with_ymd_and_hms(2025, 3, 1, 14, 30, 5).unwrap(),
            assets: vec![],
        };

        assert_eq!(
            csv_row(&incident),
            "2025-03-01,14:30:05,i1,RE-V5RC-25-0000,,Auto Skills 2,1234A,Major,<SG1> <SG2>,line one line two"
        );
    }

    #[test]
    fn csv_escapes_embedded_commas_and_quotes() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
