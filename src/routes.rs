use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use warp::Filter;
use warp::http::StatusCode;

use crate::predictor::{Predict, PredictError};

pub const BAD_INPUT: &str = "param 'v' must be a float";
pub const PREDICTION_FAILED: &str = "an error happened while running prediction";

/// Shared state handed to every request.
#[derive(Clone)]
pub struct PredictService {
    predictor: Arc<dyn Predict>,
    limiter: Arc<Semaphore>,
}

impl PredictService {
    pub fn new(predictor: Arc<dyn Predict>, max_concurrent: usize) -> Self {
        Self {
            predictor,
            limiter: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    async fn predict(&self, x: f64) -> Result<f32, PredictError> {
        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| PredictError::Unavailable(e.to_string()))?;

        let predictor = self.predictor.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            predictor.predict(x)
        })
        .await
        .map_err(|e| PredictError::Unavailable(e.to_string()))?
    }
}

/// Parses `v` the way a strict float parser does: a literal that overflows
/// to infinity is out of range, spelled-out infinities are accepted, and
/// `nan` takes no sign.
pub fn parse_value(raw: &str) -> Option<f64> {
    let value: f64 = raw.parse().ok()?;
    if value.is_nan() && raw.starts_with(['+', '-']) {
        return None;
    }
    if value.is_infinite() {
        let digits = raw.trim_start_matches(['+', '-']);
        let spelled = digits.eq_ignore_ascii_case("inf") || digits.eq_ignore_ascii_case("infinity");
        if !spelled {
            return None;
        }
    }
    Some(value)
}

/// Six fixed decimals; non-finite values as `+Inf`, `-Inf` and `NaN`.
pub fn format_prediction(p: f32) -> String {
    let value = if p.is_nan() {
        "NaN".to_string()
    } else if p == f32::INFINITY {
        "+Inf".to_string()
    } else if p == f32::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        format!("{:.6}", p)
    };
    format!("predicted: {}\n", value)
}

fn with_service(
    service: PredictService,
) -> impl Filter<Extract = (PredictService,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

async fn predict_handler(
    params: Vec<(String, String)>,
    service: PredictService,
) -> Result<impl warp::Reply, Infallible> {
    let raw = params
        .iter()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.as_str());

    let Some(x) = raw.and_then(parse_value) else {
        debug!(v = ?raw, "Rejected prediction input");
        return Ok(warp::reply::with_status(
            BAD_INPUT.to_string(),
            StatusCode::BAD_REQUEST,
        ));
    };

    match service.predict(x).await {
        Ok(p) => {
            debug!(input = x, prediction = p, "Prediction served");
            Ok(warp::reply::with_status(format_prediction(p), StatusCode::OK))
        }
        Err(e) => {
            warn!(input = x, error = %e, "Prediction failed");
            Ok(warp::reply::with_status(
                PREDICTION_FAILED.to_string(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

fn route_predict(
    service: PredictService,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::any()
        .and(warp::query::<Vec<(String, String)>>())
        .and(with_service(service))
        .and_then(predict_handler)
}

/// Every path and method goes to the predictor.
pub fn routes(
    service: PredictService,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    route_predict(service).with(warp::trace::request())
}
