use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::exporter::{IMPRESSIONS_MODE_HEADER, MACHINE_IP_HEADER, MACHINE_NAME_HEADER, SDK_VERSION_HEADER};
use crate::ingest::{IngestError, Ingestor};

const IMPRESSIONS_ROUTE: &str = "/api/testImpressions/bulk";

fn response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::default());
    *resp.status_mut() = status;
    resp
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Validate the incoming request: route, method, and body.
async fn validate<B>(req: Request<B>) -> Result<(HeaderMap, Bytes), (StatusCode, String)>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    if path != IMPRESSIONS_ROUTE {
        return Err((StatusCode::NOT_FOUND, format!("unknown path: {path}")));
    }
    if method != Method::POST {
        return Err((StatusCode::METHOD_NOT_ALLOWED, format!("{method} {path}")));
    }

    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|c| c.to_bytes()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("POST {path}: failed to read body"),
        )
    })?;

    Ok((parts.headers, body))
}

async fn handle<B>(req: Request<B>, ingestor: Ingestor) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let (headers, body) = match validate(req).await {
        Ok(pair) => pair,
        Err((status, reason)) => {
            warn!(%reason, "impressions request rejected");
            return Ok(response(status));
        }
    };

    let result = ingestor.add_impressions(
        &body,
        header(&headers, SDK_VERSION_HEADER),
        header(&headers, MACHINE_IP_HEADER),
        header(&headers, MACHINE_NAME_HEADER),
        header(&headers, IMPRESSIONS_MODE_HEADER),
    );

    match result {
        Ok(records) => {
            debug!(records, "impressions queued");
            Ok(response(StatusCode::OK))
        }
        Err(IngestError::Decode(e)) => {
            warn!(error = %e, "malformed impressions payload");
            Ok(response(StatusCode::BAD_REQUEST))
        }
        Err(IngestError::QueueFull) => {
            let mut resp = response(StatusCode::SERVICE_UNAVAILABLE);
            resp.headers_mut()
                .insert("Retry-After", hyper::header::HeaderValue::from_static("1"));
            Ok(resp)
        }
        // Workers have shut down.
        Err(IngestError::Closed) => Ok(response(StatusCode::BAD_GATEWAY)),
    }
}

pub async fn serve(listener: TcpListener, ingestor: Ingestor, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let ingestor = ingestor.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, ingestor.clone()));
                    let _ = Builder::new(hyper_util::rt::TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}
