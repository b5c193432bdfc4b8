//! Draw source contracts, the remote payload shape, and payload normalization.

use async_trait::async_trait;
use lotto_core::{parse_api_date, DrawNumbers, DrawRecord, NumbersError};
use lotto_storage::{FetchError, FetchOutcome, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "lotto-adapters";

pub const MEGA_SENA_GAME_TYPE: &str = "MEGA_SENA";
pub const DEFAULT_BASE_URL: &str = "https://api.guidi.dev.br/loteria/megasena";

/// A drawn number as the service reports it: usually a zero-padded string,
/// occasionally a bare integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawNumber {
    Text(String),
    Int(u64),
}

impl RawNumber {
    fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Int(n) => n.to_string(),
        }
    }
}

/// Draw record exactly as served. Every field is optional so that absence is
/// classified during normalization rather than failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDrawPayload {
    #[serde(default)]
    pub tipo_jogo: Option<String>,
    #[serde(default)]
    pub numero: Option<u32>,
    #[serde(default)]
    pub data_apuracao: Option<String>,
    #[serde(default)]
    pub lista_dezenas: Option<Vec<RawNumber>>,
}

impl RawDrawPayload {
    /// Fills a missing `numero` with the id the payload was requested under.
    pub fn with_fallback_id(mut self, id: u32) -> Self {
        if self.numero.is_none() {
            self.numero = Some(id);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("game type {found:?} is not {MEGA_SENA_GAME_TYPE}")]
    WrongGameType { found: Option<String> },
    #[error("payload is missing `{0}`")]
    IncompleteData(&'static str),
    #[error("malformed draw date `{0}`")]
    MalformedDate(String),
    #[error("invalid drawn numbers: {0}")]
    InvalidNumbers(#[from] NumbersError),
    #[error("requested draw {requested} but payload is draw {found}")]
    IdMismatch { requested: u32, found: u32 },
}

/// Converts a raw payload into a canonical [`DrawRecord`].
///
/// Checks run in a fixed order (game type, completeness, date, numbers) so a
/// payload with several problems always reports the same one.
pub fn normalize_payload(payload: &RawDrawPayload) -> Result<DrawRecord, DataError> {
    if payload.tipo_jogo.as_deref() != Some(MEGA_SENA_GAME_TYPE) {
        return Err(DataError::WrongGameType {
            found: payload.tipo_jogo.clone(),
        });
    }

    let numbers = match payload.lista_dezenas.as_deref() {
        Some(list) if !list.is_empty() => list,
        _ => return Err(DataError::IncompleteData("listaDezenas")),
    };
    let raw_date = match payload.data_apuracao.as_deref() {
        Some(d) if !d.trim().is_empty() => d,
        _ => return Err(DataError::IncompleteData("dataApuracao")),
    };
    let id = match payload.numero {
        Some(id) if id >= 1 => id,
        _ => return Err(DataError::IncompleteData("numero")),
    };

    let date = parse_api_date(raw_date).ok_or_else(|| DataError::MalformedDate(raw_date.into()))?;
    let texts = numbers.iter().map(RawNumber::to_text).collect::<Vec<_>>();
    let numbers = DrawNumbers::parse_strs(&texts)?;

    Ok(DrawRecord { id, date, numbers })
}

#[derive(Debug, Error)]
pub enum DrawError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Data(#[from] DataError),
}

#[async_trait]
pub trait DrawSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// The most recent draw. Absence of a latest draw is an error, not an outcome.
    async fn latest(&self) -> Result<RawDrawPayload, FetchError>;

    async fn by_id(&self, id: u32) -> Result<FetchOutcome<RawDrawPayload>, FetchError>;
}

#[derive(Debug)]
pub struct HttpDrawSource {
    http: HttpFetcher,
    base_url: String,
}

impl HttpDrawSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn latest_url(&self) -> String {
        format!("{}/ultimo", self.base_url)
    }

    pub fn draw_url(&self, id: u32) -> String {
        format!("{}/{id}", self.base_url)
    }
}

#[async_trait]
impl DrawSource for HttpDrawSource {
    fn source_id(&self) -> &'static str {
        "megasena-http"
    }

    async fn latest(&self) -> Result<RawDrawPayload, FetchError> {
        let url = self.latest_url();
        match self.http.get_json(&url).await? {
            FetchOutcome::Found(payload) => Ok(payload),
            FetchOutcome::NotFound => Err(FetchError::HttpStatus { status: 404, url }),
        }
    }

    async fn by_id(&self, id: u32) -> Result<FetchOutcome<RawDrawPayload>, FetchError> {
        self.http.get_json(&self.draw_url(id)).await
    }
}

pub async fn fetch_latest(source: &dyn DrawSource) -> Result<DrawRecord, DrawError> {
    let payload = source.latest().await?;
    let record = normalize_payload(&payload)?;
    debug!(id = record.id, date = %record.date, "fetched latest draw");
    Ok(record)
}

pub async fn fetch_by_id(
    source: &dyn DrawSource,
    id: u32,
) -> Result<FetchOutcome<DrawRecord>, DrawError> {
    match source.by_id(id).await? {
        FetchOutcome::Found(payload) => {
            let record = normalize_payload(&payload.with_fallback_id(id))?;
            if record.id != id {
                return Err(DataError::IdMismatch {
                    requested: id,
                    found: record.id,
                }
                .into());
            }
            Ok(FetchOutcome::Found(record))
        }
        FetchOutcome::NotFound => Ok(FetchOutcome::NotFound),
    }
}

/// Resolves only the latest draw id; the rest of the payload is not validated.
pub async fn latest_draw_id(source: &dyn DrawSource) -> Result<u32, DrawError> {
    let payload = source.latest().await?;
    payload
        .numero
        .ok_or(DrawError::Data(DataError::IncompleteData("numero")))
}
