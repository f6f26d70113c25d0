use std::convert::Infallible;
use std::net::TcpListener;
use std::sync::Arc;

use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response, StatusCode};
use parrot_utils::error::Error;
use parrot_utils::ParrotResult;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::control::{ControlPlane, ErrorBody};
use crate::model::ProcessorDefinition;

/// Serve the processor REST surface for `plane` on `listener` until
/// `shutdown` resolves.
///
/// | Method/Path | Command |
/// |---|---|
/// | `GET /processors` | list |
/// | `GET /processors/{id}` | get |
/// | `POST /processors` | add |
/// | `GET /processors/{id}/cluster` | cluster view |
/// | `POST /processors/{id}/start`, `/stop`, `/restart` | state commands |
/// | `DELETE /processors/{id}` | delete |
///
/// Failures answer with a non-2xx status and an [`ErrorBody`].
pub fn serve_with_shutdown<F>(
    listener: TcpListener,
    plane: Arc<dyn ControlPlane>,
    shutdown: F,
) -> JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = listener.set_nonblocking(true) {
            tracing::error!(error = ?e, "failed to set listener to non-blocking");
            return;
        }
        let tcp_listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = ?e, "failed to convert listener to tokio listener");
                return;
            }
        };
        let mut shutdown_fut = Box::pin(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown_fut => break,
                accept = tcp_listener.accept() => {
                    match accept {
                        Ok((stream, _peer)) => {
                            let plane = plane.clone();
                            let svc = service_fn(move |req: Request<Body>| {
                                let plane = plane.clone();
                                async move { Ok::<_, Infallible>(handle(plane.as_ref(), req).await) }
                            });
                            tokio::spawn(async move {
                                if let Err(err) = hyper::server::conn::Http::new().serve_connection(stream, svc).await {
                                    tracing::error!(error = ?err, "control plane connection error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = ?e, "failed to accept control plane connection");
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("control plane server stopped");
    })
}

async fn handle(plane: &dyn ControlPlane, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["processors"]) => json(StatusCode::OK, plane.list_processors().await),
        (&Method::POST, ["processors"]) => match read_definition(req).await {
            Ok(def) => json(StatusCode::CREATED, plane.add_processor(def).await),
            Err(e) => Err(e),
        },
        (&Method::GET, ["processors", id]) => json(StatusCode::OK, plane.get_processor(id).await),
        (&Method::DELETE, ["processors", id]) => plane.delete_processor(id).await.map(|()| {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::NO_CONTENT;
            response
        }),
        (&Method::GET, ["processors", id, "cluster"]) => {
            json(StatusCode::OK, plane.processor_cluster(id).await)
        }
        (&Method::POST, ["processors", id, "start"]) => json(StatusCode::OK, plane.start_processor(id).await),
        (&Method::POST, ["processors", id, "stop"]) => json(StatusCode::OK, plane.stop_processor(id).await),
        (&Method::POST, ["processors", id, "restart"]) => {
            json(StatusCode::OK, plane.restart_processor(id).await)
        }
        _ => {
            return error_response(StatusCode::NOT_FOUND, format!("no route for {method} {path}"));
        }
    };

    result.unwrap_or_else(|e| {
        tracing::warn!(method = %method, path = %path, error = %e, "control command failed");
        error_response(status_for(&e), e.to_string())
    })
}

async fn read_definition(req: Request<Body>) -> ParrotResult<ProcessorDefinition> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|e| Error::Transport(format!("failed to read request body: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn json<T: Serialize>(status: StatusCode, result: ParrotResult<T>) -> ParrotResult<Response<Body>> {
    let body = serde_json::to_vec(&result?)?;
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    let body = serde_json::to_vec(&ErrorBody { message }).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Precondition(_) => StatusCode::CONFLICT,
        Error::Json(_) | Error::Yaml(_) => StatusCode::BAD_REQUEST,
        Error::Domain { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
