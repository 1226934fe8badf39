use rhai::{Dynamic, Engine, Map, Scope};
use tokio::runtime::Handle;

use super::{Capability, CapabilityContext};

/// Exposes outbound HTTP to scripts as `http`.
///
/// Requests share the worker's client. Failures are reported as a map with an
/// `error` key rather than as script errors, so scripts can retry without
/// crashing their task.
pub(crate) struct HttpCapability;

#[derive(Clone)]
struct HttpApi {
    client: reqwest::Client,
    rt: Handle,
}

impl HttpApi {
    fn request(&self, builder_result: Result<reqwest::RequestBuilder, String>) -> Map {
        let builder = match builder_result {
            Ok(builder) => builder,
            Err(message) => return error_map(message),
        };

        let outcome = self.rt.block_on(async move {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let mut headers = Map::new();
            for (name, value) in response.headers() {
                headers.insert(
                    name.as_str().into(),
                    Dynamic::from(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                );
            }
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        });

        match outcome {
            Ok((status, headers, body)) => {
                let mut map = Map::new();
                map.insert("body".into(), Dynamic::from(body));
                map.insert("status".into(), Dynamic::from(status as i64));
                map.insert("headers".into(), Dynamic::from(headers));
                map
            }
            Err(e) => error_map(e.to_string()),
        }
    }

    fn parse(&self, raw: &str) -> Result<url::Url, String> {
        url::Url::parse(raw).map_err(|e| format!("invalid url {raw:?}: {e}"))
    }

    fn get(&self, url: &str) -> Map {
        self.request(self.parse(url).map(|u| self.client.get(u)))
    }

    fn post(&self, url: &str, body: String) -> Map {
        self.request(self.parse(url).map(|u| self.client.post(u).body(body)))
    }

    fn post_form(&self, url: &str, form: Map) -> Map {
        let pairs: Vec<(String, String)> = form
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        self.request(self.parse(url).map(|u| self.client.post(u).form(&pairs)))
    }

    fn put(&self, url: &str, body: String) -> Map {
        self.request(self.parse(url).map(|u| self.client.put(u).body(body)))
    }

    fn delete(&self, url: &str) -> Map {
        self.request(self.parse(url).map(|u| self.client.delete(u)))
    }
}

fn error_map(message: String) -> Map {
    let mut map = Map::new();
    map.insert("error".into(), Dynamic::from(message));
    map
}

impl Capability for HttpCapability {
    fn name(&self) -> &str {
        "http"
    }

    fn install(
        &self,
        engine: &mut Engine,
        scope: &mut Scope<'static>,
        ctx: &CapabilityContext,
    ) -> anyhow::Result<()> {
        engine.register_type_with_name::<HttpApi>("Http");
        engine.register_fn("Get", |api: &mut HttpApi, url: String| api.get(&url));
        engine.register_fn("Post", |api: &mut HttpApi, url: String, body: String| {
            api.post(&url, body)
        });
        engine.register_fn("PostForm", |api: &mut HttpApi, url: String, form: Map| {
            api.post_form(&url, form)
        });
        engine.register_fn("Put", |api: &mut HttpApi, url: String, body: String| {
            api.put(&url, body)
        });
        engine.register_fn("Delete", |api: &mut HttpApi, url: String| api.delete(&url));

        scope.push(
            "http",
            HttpApi {
                client: ctx.shared.client.clone(),
                rt: ctx.rt.clone(),
            },
        );

        Ok(())
    }
}
