//! Dataset operations: data stores, data sources, and pixel extraction.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::client::{JobHandle, ProgressCallback, WebApiClient};
use crate::error::CallError;

/// A data store known to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataStore {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Remaining fields, kept as sent.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A data source within a data store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Clone)]
pub struct DatasetApi {
    client: Arc<WebApiClient>,
}

impl DatasetApi {
    pub fn new(client: Arc<WebApiClient>) -> Self {
        Self { client }
    }

    pub fn get_data_stores(&self) -> Result<JobHandle<Vec<DataStore>>, CallError> {
        self.client
            .call("get_data_stores", vec![], None, decode("data stores"))
    }

    pub fn get_data_sources(
        &self,
        data_store_id: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<JobHandle<Vec<DataSource>>, CallError> {
        self.client.call(
            "get_data_sources",
            vec![json!(data_store_id)],
            on_progress,
            decode("data sources"),
        )
    }

    /// `(start, end)` of a data source's temporal coverage, if the service
    /// reports both ends.
    pub fn get_data_source_temporal_coverage(
        &self,
        data_store_id: &str,
        data_source_id: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<JobHandle<Option<(String, String)>>, CallError> {
        self.client.call(
            "get_data_source_temporal_coverage",
            vec![json!(data_store_id), json!(data_source_id)],
            on_progress,
            |value| Ok(temporal_coverage(&value)),
        )
    }

    pub fn add_local_data_source(
        &self,
        data_source_id: &str,
        file_path_pattern: &str,
        on_progress: Option<ProgressCallback>,
    ) -> Result<JobHandle<Vec<DataSource>>, CallError> {
        self.client.call(
            "add_local_data_source",
            vec![json!(data_source_id), json!(file_path_pattern)],
            on_progress,
            decode("data sources"),
        )
    }

    pub fn remove_local_data_source(
        &self,
        data_source_id: &str,
        remove_files: bool,
        on_progress: Option<ProgressCallback>,
    ) -> Result<JobHandle<Vec<DataSource>>, CallError> {
        self.client.call(
            "remove_local_data_source",
            vec![json!(data_source_id), json!(remove_files)],
            on_progress,
            decode("data sources"),
        )
    }

    /// Variable values at `(lon, lat)`, or `None` if the point is outside the data.
    pub fn extract_pixel_values(
        &self,
        base_dir: &str,
        source: &str,
        point: (f64, f64),
        indexers: &BTreeMap<String, i64>,
    ) -> Result<JobHandle<Option<BTreeMap<String, f64>>>, CallError> {
        self.client.call(
            "extract_pixel_values",
            vec![
                json!(base_dir),
                json!(source),
                json!([point.0, point.1]),
                json!(indexers),
            ],
            None,
            |value| {
                if value.is_null() {
                    return Ok(None);
                }
                serde_json::from_value(value)
                    .map(Some)
                    .context("invalid pixel values response")
            },
        )
    }
}

fn decode<T: DeserializeOwned>(what: &'static str) -> impl FnOnce(Value) -> anyhow::Result<T> {
    move |value| serde_json::from_value(value).with_context(|| format!("invalid {what} response"))
}

fn temporal_coverage(value: &Value) -> Option<(String, String)> {
    let bound = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    Some((
        bound("temporal_coverage_start")?,
        bound("temporal_coverage_end")?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, JsonCodec};
    use crate::bridge::protocol::{ClientFrame, JobProgress, ServerFrame};
    use crate::transport::Transport;
    use futures::{SinkExt, StreamExt};
    use std::sync::Mutex;
    use tokio::net::UnixStream;
    use tokio_util::codec::Framed;

    type Peer = Framed<UnixStream, JsonCodec<Value>>;

    fn api_and_peer() -> (DatasetApi, Peer) {
        let (a, b) = UnixStream::pair().unwrap();
        let client = WebApiClient::new(Transport::from_stream(a, DEFAULT_MAX_FRAME_LENGTH));
        (
            DatasetApi::new(Arc::new(client)),
            Framed::new(b, JsonCodec::new()),
        )
    }

    /// Read one call frame and answer it with `value`. Returns the call frame.
    async fn answer(peer: &mut Peer, value: Value) -> Value {
        let raw = peer.next().await.unwrap().unwrap();
        let frame: ClientFrame = serde_json::from_value(raw.clone()).unwrap();
        peer.send(
            serde_json::to_value(ServerFrame::Result {
                job_id: frame.job_id(),
                value,
            })
            .unwrap(),
        )
        .await
        .unwrap();
        raw
    }

    #[tokio::test]
    async fn get_data_stores_keeps_unknown_fields() {
        let (api, mut peer) = api_and_peer();
        let handle = api.get_data_stores().unwrap();

        let call = answer(
            &mut peer,
            json!([
                {"id": "esa_cci_odp", "title": "ESA CCI Open Data Portal", "isLocal": false},
                {"id": "local"}
            ]),
        )
        .await;
        let call: ClientFrame = serde_json::from_value(call).unwrap();
        insta::assert_json_snapshot!(call, @r#"
        {
          "type": "call",
          "job_id": 1,
          "method": "get_data_stores",
          "args": []
        }
        "#);

        let stores = handle.await.unwrap();
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].title.as_deref(), Some("ESA CCI Open Data Portal"));
        assert_eq!(stores[0].extra.get("isLocal"), Some(&json!(false)));
        assert_eq!(stores[1].id, "local");
        assert!(stores[1].title.is_none());
    }

    #[tokio::test]
    async fn get_data_sources_reports_progress() {
        let (api, mut peer) = api_and_peer();
        let labels = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&labels);
        let handle = api
            .get_data_sources(
                "local",
                Some(Box::new(move |p: &JobProgress| {
                    sink.lock().unwrap().push(p.label.clone());
                })),
            )
            .unwrap();

        let raw = peer.next().await.unwrap().unwrap();
        assert_eq!(raw["method"], "get_data_sources");
        assert_eq!(raw["args"], json!(["local"]));
        let job_id = serde_json::from_value::<ClientFrame>(raw).unwrap().job_id();

        for frame in [
            ServerFrame::Progress {
                job_id,
                payload: JobProgress::new("Scanning").with_fraction(0.5),
            },
            ServerFrame::Result {
                job_id,
                value: json!([{"id": "sst", "title": "Sea surface temperature"}]),
            },
        ] {
            peer.send(serde_json::to_value(frame).unwrap()).await.unwrap();
        }

        let sources = handle.await.unwrap();
        assert_eq!(sources[0].id, "sst");
        assert_eq!(*labels.lock().unwrap(), vec!["Scanning".to_string()]);
    }

    #[tokio::test]
    async fn malformed_data_sources_fail_transform() {
        let (api, mut peer) = api_and_peer();
        let handle = api.add_local_data_source("mine", "/data/*.nc", None).unwrap();

        let call = answer(&mut peer, json!({"not": "a list"})).await;
        assert_eq!(call["args"], json!(["mine", "/data/*.nc"]));

        let err = handle.await.unwrap_err();
        assert!(matches!(err, CallError::Transform(_)));
        assert!(err.to_string().contains("invalid data sources response"));
    }

    #[tokio::test]
    async fn remove_local_data_source_args() {
        let (api, mut peer) = api_and_peer();
        let handle = api.remove_local_data_source("mine", true, None).unwrap();
        let call = answer(&mut peer, json!([])).await;
        assert_eq!(call["method"], "remove_local_data_source");
        assert_eq!(call["args"], json!(["mine", true]));
        assert!(handle.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn temporal_coverage_needs_both_ends() {
        let (api, mut peer) = api_and_peer();

        let handle = api
            .get_data_source_temporal_coverage("local", "sst", None)
            .unwrap();
        let call = answer(
            &mut peer,
            json!({"temporal_coverage_start": "2000-01-01", "temporal_coverage_end": "2010-12-31"}),
        )
        .await;
        assert_eq!(call["args"], json!(["local", "sst"]));
        assert_eq!(
            handle.await.unwrap(),
            Some(("2000-01-01".to_string(), "2010-12-31".to_string()))
        );

        let handle = api
            .get_data_source_temporal_coverage("local", "sst", None)
            .unwrap();
        answer(&mut peer, json!({"temporal_coverage_start": "2000-01-01"})).await;
        assert_eq!(handle.await.unwrap(), None);

        let handle = api
            .get_data_source_temporal_coverage("local", "sst", None)
            .unwrap();
        answer(&mut peer, Value::Null).await;
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn extract_pixel_values_shapes_point_and_indexers() {
        let (api, mut peer) = api_and_peer();
        let indexers = BTreeMap::from([("time".to_string(), 3)]);

        let handle = api
            .extract_pixel_values("/workspace", "ds_1", (10.5, 53.25), &indexers)
            .unwrap();
        let call = answer(&mut peer, json!({"sst": 290.5, "analysed_sst": 291.0})).await;
        insta::assert_json_snapshot!(call["args"], @r#"
        [
          "/workspace",
          "ds_1",
          [
            10.5,
            53.25
          ],
          {
            "time": 3
          }
        ]
        "#);

        let values = handle.await.unwrap().unwrap();
        assert_eq!(values.get("sst"), Some(&290.5));

        let handle = api
            .extract_pixel_values("/workspace", "ds_1", (0.0, 0.0), &BTreeMap::new())
            .unwrap();
        answer(&mut peer, Value::Null).await;
        assert_eq!(handle.await.unwrap(), None);
    }
}
