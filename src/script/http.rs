//! Outbound HTTP capability for sandboxed scripts.
//!
//! Thin wrappers over a blocking HTTP client. No timeout or retry policy
//! is added here: network failures surface as script errors, and slow
//! endpoints hold the invocation open until the client's own defaults
//! give up. Non-2xx responses are returned to the script with `ok =
//! false` rather than raised.

use mlua::{Lua, LuaSerdeExt, Result as LuaResult, Table, UserData, UserDataMethods, Value};
use reqwest::blocking::{Client, RequestBuilder, Response};

/// Register the `http` group on the given table: `http.get`,
/// `http.post`, `http.put` and the cookie-preserving `http.session()`.
pub fn register(lua: &Lua, parent: &Table) -> LuaResult<()> {
    let http = lua.create_table()?;

    let get_fn = lua.create_function(|lua, (url, opts): (String, Option<Table>)| {
        let client = build_client()?;
        request_get(lua, &client, &url, opts)
    })?;
    http.set("get", get_fn)?;

    let post_fn = lua.create_function(
        |lua, (url, body, json, opts): (String, Option<String>, Option<Table>, Option<Table>)| {
            let client = build_client()?;
            request_with_body(lua, client.post(&url), body, json, opts)
        },
    )?;
    http.set("post", post_fn)?;

    let put_fn = lua.create_function(
        |lua, (url, body, json, opts): (String, Option<String>, Option<Table>, Option<Table>)| {
            let client = build_client()?;
            request_with_body(lua, client.put(&url), body, json, opts)
        },
    )?;
    http.set("put", put_fn)?;

    let session_fn = lua.create_function(|_, ()| HttpSession::new())?;
    http.set("session", session_fn)?;

    parent.set("http", http)?;
    Ok(())
}

fn build_client() -> LuaResult<Client> {
    Client::builder().build().map_err(mlua::Error::external)
}

fn request_get(lua: &Lua, client: &Client, url: &str, opts: Option<Table>) -> LuaResult<Table> {
    let req = apply_opts(client.get(url), opts)?;
    let resp = req.send().map_err(mlua::Error::external)?;
    response_to_table(lua, resp)
}

fn request_with_body(
    lua: &Lua,
    mut req: RequestBuilder,
    body: Option<String>,
    json: Option<Table>,
    opts: Option<Table>,
) -> LuaResult<Table> {
    if let Some(body) = body {
        req = req.body(body);
    }
    if let Some(json) = json {
        let value: serde_json::Value = lua.from_value(Value::Table(json))?;
        req = req.json(&value);
    }
    let req = apply_opts(req, opts)?;
    let resp = req.send().map_err(mlua::Error::external)?;
    response_to_table(lua, resp)
}

/// Apply the options table to a request. Supported keys: `headers`
/// (string -> string map).
fn apply_opts(mut req: RequestBuilder, opts: Option<Table>) -> LuaResult<RequestBuilder> {
    if let Some(opts) = opts {
        if let Some(headers) = opts.get::<Option<Table>>("headers")? {
            for pair in headers.pairs::<String, String>() {
                let (name, value) = pair?;
                req = req.header(name, value);
            }
        }
    }
    Ok(req)
}

fn response_to_table(lua: &Lua, resp: Response) -> LuaResult<Table> {
    let status = resp.status();

    let headers = lua.create_table()?;
    for (name, value) in resp.headers() {
        if let Ok(value) = value.to_str() {
            headers.set(name.as_str(), value)?;
        }
    }

    let text = resp.text().map_err(mlua::Error::external)?;

    let out = lua.create_table()?;
    out.set("status", status.as_u16())?;
    out.set("ok", status.is_success())?;
    out.set("text", text)?;
    out.set("headers", headers)?;
    Ok(out)
}

/// A reusable client preserving cookies and connection state across
/// calls within one script run.
pub struct HttpSession {
    client: Client,
}

impl HttpSession {
    fn new() -> LuaResult<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .build()
            .map_err(mlua::Error::external)?;
        Ok(Self { client })
    }
}

impl UserData for HttpSession {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("get", |lua, this, (url, opts): (String, Option<Table>)| {
            request_get(lua, &this.client, &url, opts)
        });

        methods.add_method(
            "post",
            |lua,
             this,
             (url, body, json, opts): (String, Option<String>, Option<Table>, Option<Table>)| {
                request_with_body(lua, this.client.post(&url), body, json, opts)
            },
        );

        methods.add_method(
            "put",
            |lua,
             this,
             (url, body, json, opts): (String, Option<String>, Option<Table>, Option<Table>)| {
                request_with_body(lua, this.client.put(&url), body, json, opts)
            },
        );
    }
}
