use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use crate::dispatcher::InferenceDispatcher;
use crate::error::ApiError;
use crate::models::{PredictionResponse, StatusResponse};
use crate::preprocess::ModelKind;

/// Shared, read-only request context.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<InferenceDispatcher>,
    pub inference_slots: Arc<Semaphore>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        dispatcher: InferenceDispatcher,
        max_concurrent_inferences: usize,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            inference_slots: Arc::new(Semaphore::new(max_concurrent_inferences)),
            max_upload_bytes,
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/").route(web::get().to(status)))
        .service(web::resource("/predict").route(web::post().to(predict)));
}

pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let dispatcher = &state.dispatcher;
    HttpResponse::Ok().json(StatusResponse {
        message: "Welcome to the prediction API".to_string(),
        models_loaded: dispatcher
            .registry()
            .kinds()
            .map(|kind| kind.to_string())
            .collect(),
        classes_loaded: dispatcher.labels().len(),
    })
}

pub async fn predict(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("predict", %request_id, model = tracing::field::Empty);

    handle_prediction(state, payload).instrument(span).await
}

async fn handle_prediction(
    state: web::Data<AppState>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let form = PredictForm::read(payload, state.max_upload_bytes).await?;

    let image = form.image.ok_or(ApiError::MissingImage)?;
    let model = form.model.ok_or(ApiError::MissingField("model"))?;
    tracing::Span::current().record("model", model.as_str());

    let kind: ModelKind = model.parse().map_err(|_| {
        tracing::warn!(model = %model, "Rejected unknown model");
        ApiError::UnknownModel(model.clone())
    })?;

    tracing::info!(
        filename = image.filename.as_deref().unwrap_or("<unnamed>"),
        bytes = image.bytes.len(),
        "Received prediction request"
    );

    // Queue here rather than on the blocking pool once all slots are busy.
    // The permit travels with the blocking job so a dropped request keeps its
    // slot until the inference actually finishes.
    let permit = state
        .inference_slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| ApiError::Processing(e.to_string()))?;

    let dispatcher = state.dispatcher.clone();
    let outcome = web::block(move || {
        let _permit = permit;
        dispatcher.classify_bytes(kind, &image.bytes)
    })
    .await?;

    let prediction = outcome.map_err(|e| {
        tracing::error!(error = %e, "Error during prediction");
        ApiError::from(e)
    })?;

    tracing::info!(
        class = %prediction.class_name,
        confidence = prediction.confidence,
        "Prediction successful"
    );
    tracing::debug!(raw = ?prediction.scores, "Raw predictions");

    Ok(HttpResponse::Ok().json(PredictionResponse::from(prediction)))
}

struct Upload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct PredictForm {
    model: Option<String>,
    image: Option<Upload>,
}

impl PredictForm {
    /// Buffers the `model` and `image` fields; anything else is drained and dropped.
    async fn read(mut payload: Multipart, limit: usize) -> Result<Self, ApiError> {
        let mut form = PredictForm::default();

        while let Some(item) = payload.next().await {
            let mut field = item?;
            let disposition = field.content_disposition();
            let name = disposition.get_name().unwrap_or_default().to_string();
            let filename = disposition.get_filename().map(str::to_string);

            let mut data = Vec::new();
            while let Some(chunk) = field.next().await {
                let chunk = chunk?;
                if data.len() + chunk.len() > limit {
                    return Err(ApiError::PayloadTooLarge { field: name, limit });
                }
                data.extend_from_slice(&chunk);
            }

            match name.as_str() {
                "model" => {
                    let value = String::from_utf8(data)
                        .map_err(|_| ApiError::MalformedForm("`model` is not UTF-8".to_string()))?;
                    form.model = Some(value.trim().to_string());
                }
                "image" if !data.is_empty() => {
                    form.image = Some(Upload {
                        filename,
                        bytes: data,
                    });
                }
                "image" => {}
                other => tracing::debug!(field = other, "Ignoring unexpected form field"),
            }
        }

        Ok(form)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::ClassLabelTable;
    use crate::models::ErrorResponse;
    use crate::preprocess::TensorLayout;
    use crate::registry::tests::{registry_of, FixedModel};
    use actix_web::http::{header, StatusCode};
    use actix_web::{test, App};
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    const BOUNDARY: &str = "----classifier-test-boundary";

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, &'a [u8]),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, filename, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                             Content-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 3 % 256) as u8, (y * 5 % 256) as u8, 128])
        });
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(90))
            .unwrap();
        buf
    }

    fn state_with(model: Arc<FixedModel>, classes: &[&str], max_upload_bytes: usize) -> AppState {
        let registry = Arc::new(registry_of(model.clone(), model.clone(), model));
        let labels = Arc::new(classes.iter().copied().collect::<ClassLabelTable>());
        AppState::new(
            InferenceDispatcher::new(registry, labels, TensorLayout::Nhwc),
            2,
            max_upload_bytes,
        )
    }

    fn predict_request(parts: &[Part<'_>]) -> test::TestRequest {
        test::TestRequest::post()
            .uri("/predict")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            ))
            .set_payload(multipart_body(parts))
    }

    #[actix_rt::test]
    async fn status_reports_models_and_class_count() {
        let state = state_with(FixedModel::new(vec![1.0]), &["apple", "banana", "kiwi"], 1024);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/").to_request();
        let body: StatusResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body.message, "Welcome to the prediction API");
        assert_eq!(body.models_loaded, ["resnet50", "densenet169", "mobilenet_v2"]);
        assert_eq!(body.classes_loaded, 3);
    }

    #[actix_rt::test]
    async fn valid_jpeg_gets_a_prediction() {
        let model = FixedModel::new(vec![0.1, 0.7, 0.2]);
        let state = state_with(model.clone(), &["apple", "banana", "kiwi"], 1 << 20);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let image = jpeg(320, 240);
        let req = predict_request(&[
            Part::Text("model", "resnet50"),
            Part::File("image", "fruit.jpg", &image),
        ])
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["predictedClass"], "banana");
        assert!(body["confidence"].is_f64());
        assert_eq!(body["rawPredictions"].as_array().map(Vec::len), Some(3));
        assert_eq!(model.calls(), 1);
    }

    #[actix_rt::test]
    async fn unknown_model_is_a_bad_request() {
        let model = FixedModel::new(vec![1.0]);
        let state = state_with(model.clone(), &["apple"], 1 << 20);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let image = jpeg(16, 16);
        let req = predict_request(&[
            Part::Text("model", "vgg16"),
            Part::File("image", "a.jpg", &image),
        ])
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.detail, "Invalid model selection");
        assert_eq!(model.calls(), 0);
    }

    #[actix_rt::test]
    async fn missing_image_is_unprocessable() {
        let model = FixedModel::new(vec![1.0]);
        let state = state_with(model.clone(), &["apple"], 1 << 20);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        for parts in [
            vec![Part::Text("model", "densenet169")],
            vec![
                Part::Text("model", "densenet169"),
                Part::File("image", "empty.jpg", b""),
            ],
        ] {
            let resp = test::call_service(&app, predict_request(&parts).to_request()).await;
            assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
            let body: ErrorResponse = test::read_body_json(resp).await;
            assert_eq!(body.detail, "Image is missing");
        }
        assert_eq!(model.calls(), 0);
    }

    #[actix_rt::test]
    async fn missing_model_field_is_unprocessable() {
        let state = state_with(FixedModel::new(vec![1.0]), &["apple"], 1 << 20);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let image = jpeg(16, 16);
        let req = predict_request(&[Part::File("image", "a.jpg", &image)]).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[actix_rt::test]
    async fn corrupt_image_is_a_server_error_with_detail() {
        let model = FixedModel::new(vec![1.0]);
        let state = state_with(model.clone(), &["apple"], 1 << 20);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let req = predict_request(&[
            Part::Text("model", "mobilenet_v2"),
            Part::File("image", "broken.jpg", b"this is not a jpeg"),
        ])
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body: ErrorResponse = test::read_body_json(resp).await;
        assert!(body.detail.starts_with("cannot decode image"));
        assert_eq!(model.calls(), 0);
    }

    #[actix_rt::test]
    async fn oversized_upload_is_rejected() {
        let model = FixedModel::new(vec![1.0]);
        let state = state_with(model.clone(), &["apple"], 64);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let image = jpeg(64, 64);
        let req = predict_request(&[
            Part::Text("model", "resnet50"),
            Part::File("image", "big.jpg", &image),
        ])
        .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(model.calls(), 0);
    }

    #[actix_rt::test]
    async fn non_multipart_body_is_unprocessable() {
        let state = state_with(FixedModel::new(vec![1.0]), &["apple"], 1 << 20);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header((header::CONTENT_TYPE, "application/json"))
            .set_payload(r#"{"model":"resnet50"}"#)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    /// Sleeps through its forward pass and tracks how many passes are running.
    struct SlowModel {
        delay: std::time::Duration,
        in_flight: std::sync::atomic::AtomicUsize,
    }

    impl crate::registry::InferenceModel for SlowModel {
        fn predict(&self, _input: &ndarray::Array4<f32>) -> anyhow::Result<Vec<f32>> {
            use std::sync::atomic::Ordering;
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![1.0])
        }
    }

    #[actix_rt::test]
    async fn dropped_request_keeps_its_slot_until_inference_ends() {
        use crate::registry::{InferenceModel, ModelRegistry};
        use std::sync::atomic::Ordering;
        use std::time::Duration;

        let slow = Arc::new(SlowModel {
            delay: Duration::from_millis(800),
            in_flight: std::sync::atomic::AtomicUsize::new(0),
        });
        let registry = ModelRegistry::from_models(
            ModelKind::ALL.map(|kind| (kind, slow.clone() as Arc<dyn InferenceModel>)),
        )
        .unwrap();
        let labels = Arc::new(["apple"].into_iter().collect::<ClassLabelTable>());
        let state = AppState::new(
            InferenceDispatcher::new(Arc::new(registry), labels, TensorLayout::Nhwc),
            1,
            1 << 20,
        );
        let slots = state.inference_slots.clone();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(configure),
        )
        .await;

        let image = jpeg(16, 16);
        let req = predict_request(&[
            Part::Text("model", "resnet50"),
            Part::File("image", "slow.jpg", &image),
        ])
        .to_request();

        // The client gives up while the model is still running.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(200), test::call_service(&app, req)).await;
        assert!(abandoned.is_err());

        assert_eq!(slow.in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(slots.available_permits(), 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(slow.in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(slots.available_permits(), 1);
    }
}
