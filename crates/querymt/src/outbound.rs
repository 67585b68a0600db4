mod http_client {
    #[cfg(not(target_arch = "wasm32"))]
    pub mod imp {
        use crate::error::LLMError;
        use futures::StreamExt;
        use http::{Request, Response};
        use once_cell::sync::Lazy;
        use reqwest::Client;
        use std::error::Error;
        use tokio_stream::wrappers::ReceiverStream;

        /// A single, global client, built once
        pub static CLIENT: Lazy<Client> = Lazy::new(Client::new);

        pub async fn call_outbound(
            req: Request<Vec<u8>>,
        ) -> Result<Response<Vec<u8>>, Box<dyn Error>> {
            let client = &*CLIENT;

            // Native path: turn http::Request into reqwest and back
            let method = req
                .method()
                .as_str()
                .parse::<reqwest::Method>()
                .map_err(|e| Box::<dyn Error>::try_from(e).unwrap())?;

            let mut rb = client.request(method, req.uri().to_string());

            // propagate headers
            for (name, value) in req.headers().iter() {
                let val_str = value.to_str()?;
                rb = rb.header(name.as_str(), val_str);
            }

            let resp = rb.body(req.into_body()).send().await?.error_for_status()?;

            let status = resp.status();
            let headers = resp.headers().clone();
            let bytes = resp.bytes().await?.to_vec();

            let mut builder = Response::builder().status(status.as_u16());
            for (name, value) in headers.iter() {
                // value.as_bytes() is &[u8]; builder.header accepts either &str or &[u8]
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            Ok(builder.body(bytes).unwrap())
        }

        fn sse_data_frame(frame: &[u8]) -> Option<Vec<u8>> {
            let text = String::from_utf8_lossy(frame);
            let mut lines = Vec::new();
            for line in text.lines() {
                if let Some(rest) = line.strip_prefix("data:") {
                    lines.push(rest.trim_start());
                }
            }
            if lines.is_empty() {
                None
            } else {
                Some(lines.join("\n").into_bytes())
            }
        }

        /// Performs a streaming outbound call and hands back a stream of raw SSE
        /// `data:` payloads, one per event. A background task drives the upstream
        /// byte stream and writes parsed frames onto a bounded channel so a slow
        /// consumer applies backpressure to the producer rather than buffering the
        /// whole response in memory.
        pub async fn call_outbound_stream(
            req: Request<Vec<u8>>,
        ) -> Result<ReceiverStream<Result<Vec<u8>, LLMError>>, LLMError> {
            let client = &*CLIENT;

            let method = req
                .method()
                .as_str()
                .parse::<reqwest::Method>()
                .map_err(|e| LLMError::HttpError(e.to_string()))?;

            let mut rb = client.request(method, req.uri().to_string());
            for (name, value) in req.headers().iter() {
                let val_str = value
                    .to_str()
                    .map_err(|e| LLMError::HttpError(e.to_string()))?;
                rb = rb.header(name.as_str(), val_str);
            }

            let resp = rb
                .body(req.into_body())
                .send()
                .await
                .map_err(|e| LLMError::HttpError(e.to_string()))?
                .error_for_status()
                .map_err(|e| LLMError::HttpError(e.to_string()))?;

            let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, LLMError>>(32);

            tokio::spawn(async move {
                let mut bytes = resp.bytes_stream();
                let mut buf: Vec<u8> = Vec::new();
                while let Some(next) = bytes.next().await {
                    match next {
                        Ok(chunk) => {
                            buf.extend_from_slice(&chunk);
                            while let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") {
                                let frame: Vec<u8> = buf.drain(..pos + 2).collect();
                                if let Some(payload) = sse_data_frame(&frame) {
                                    if payload == b"[DONE]" {
                                        return;
                                    }
                                    if tx.send(Ok(payload)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(LLMError::HttpError(e.to_string()))).await;
                            return;
                        }
                    }
                }
            });

            Ok(ReceiverStream::new(rx))
        }
    }

    #[cfg(target_arch = "wasm32")]
    pub mod imp {
        use http::{Request, Response};
        //        use spin_sdk::http::{send, Request as SpinReq, Response as SpinResp};
        use std::error::Error;

        use crate::error::LLMError;

        pub async fn call_outbound(
            req: Request<Vec<u8>>,
        ) -> Result<Response<Vec<u8>>, Box<dyn Error>> {
            /*

            // Convert http::Request<Vec<u8>> → spin_sdk::http::Request
            let mut spin_req = SpinReq::builder()
                .method(req.method().clone())
                .uri(req.uri().to_string());
            for (k, v) in req.headers().iter() {
                spin_req = spin_req.header(k, v.to_str()?);
            }
            let spin_req = spin_req.body(req.into_body()).unwrap();

            // Perform the outbound HTTP in the Spin host
            let spin_resp: SpinResp = send(spin_req).await?;

            // Convert back to http::Response<Vec<u8>>
            let mut builder = Response::builder().status(spin_resp.status());
            for (k, v) in spin_resp.headers() {
                builder = builder.header(k.as_str(), v.as_str());
            }
            Ok(builder.body(spin_resp.body().to_vec()).unwrap())
            */
            Err(Box::new(LLMError::InvalidRequest("".into())))
        }

        pub async fn call_outbound_stream(
            req: Request<Vec<u8>>,
        ) -> Result<tokio_stream::wrappers::ReceiverStream<Result<Vec<u8>, LLMError>>, LLMError>
        {
            let _ = req;
            Err(LLMError::NotImplemented(
                "streaming outbound calls are not supported on wasm32".into(),
            ))
        }
    }
}

pub use http_client::imp::{call_outbound, call_outbound_stream};
