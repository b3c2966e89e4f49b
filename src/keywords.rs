//! Keyword surface of the library.
//!
//! [`KeywordLibrary`] owns the client registry for one test run and exposes
//! every operation both as a typed method and through the string-keyed
//! [`KeywordLibrary::run_keyword`] entry point used by test runners.

use crate::attachment::{Attachment, AttachmentSource, MimeType};
use crate::client::{CallOptions, ClientFactory, ClientHandle, OperationArgs, SoapClient, TransportFactory};
use crate::config::{BasicAuth, ClientCert, ClientOptions, LibraryConfig};
use crate::envelope::EnvelopeClientFactory;
use crate::error::{Result, SoapClientError};
use crate::registry::{ClientMap, ClientRegistry};
use crate::transport::HttpTransportFactory;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// One keyword invocation, as written in a suite file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordCall {
    /// Keyword name, e.g. `Create client`
    pub keyword: String,
    /// Positional arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Named arguments
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// A sequence of keyword calls run in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordSuite {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<KeywordCall>,
}

/// Keywords known to the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    CreateClient,
    CloseClient,
    CloseAllClients,
    SwitchClient,
    GetAlias,
    GetClient,
    GetClients,
    AddAttachment,
    ClearAttachments,
    CallOperation,
    CreateMessage,
    CreateObject,
    GetNamespaceUri,
    GetNamespacePrefix,
    LogNamespacePrefixMap,
    LogOpenedClients,
    DumpWsdl,
}

impl Keyword {
    pub const ALL: &'static [Keyword] = &[
        Self::CreateClient,
        Self::CloseClient,
        Self::CloseAllClients,
        Self::SwitchClient,
        Self::GetAlias,
        Self::GetClient,
        Self::GetClients,
        Self::AddAttachment,
        Self::ClearAttachments,
        Self::CallOperation,
        Self::CreateMessage,
        Self::CreateObject,
        Self::GetNamespaceUri,
        Self::GetNamespacePrefix,
        Self::LogNamespacePrefixMap,
        Self::LogOpenedClients,
        Self::DumpWsdl,
    ];

    /// Display name of the keyword.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateClient => "Create client",
            Self::CloseClient => "Close client",
            Self::CloseAllClients => "Close all clients",
            Self::SwitchClient => "Switch client",
            Self::GetAlias => "Get alias",
            Self::GetClient => "Get client",
            Self::GetClients => "Get clients",
            Self::AddAttachment => "Add attachment",
            Self::ClearAttachments => "Clear attachments",
            Self::CallOperation => "Call operation",
            Self::CreateMessage => "Create message",
            Self::CreateObject => "Create object",
            Self::GetNamespaceUri => "Get namespace URI",
            Self::GetNamespacePrefix => "Get namespace prefix",
            Self::LogNamespacePrefixMap => "Log namespace prefix map",
            Self::LogOpenedClients => "Log opened clients",
            Self::DumpWsdl => "Dump WSDL",
        }
    }

    /// Look up a keyword ignoring case, spaces and underscores.
    pub fn from_name(name: &str) -> Option<Self> {
        let wanted = normalize_name(name);
        Self::ALL
            .iter()
            .copied()
            .find(|keyword| normalize_name(keyword.name()) == wanted)
    }
}

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Log `item` to the run log and/or the console.
pub fn log_item(item: &str, to_log: bool, to_console: bool) {
    if to_log {
        info!("{item}");
    }
    if to_console {
        println!("{item}");
    }
}

/// Registry of SOAP clients with the keyword operations on top.
pub struct KeywordLibrary {
    config: LibraryConfig,
    registry: ClientRegistry,
    transports: Box<dyn TransportFactory>,
    backends: Box<dyn ClientFactory>,
}

impl std::fmt::Debug for KeywordLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeywordLibrary")
            .field("registry", &self.registry)
            .finish()
    }
}

impl KeywordLibrary {
    /// Library using HTTP transports and the envelope backend.
    pub fn new(config: LibraryConfig) -> Self {
        let backends = EnvelopeClientFactory::new(config.envelope.clone());
        Self::with_factories(config, Box::new(HttpTransportFactory), Box::new(backends))
    }

    /// Library using the given collaborator factories.
    pub fn with_factories(
        config: LibraryConfig,
        transports: Box<dyn TransportFactory>,
        backends: Box<dyn ClientFactory>,
    ) -> Self {
        Self {
            config,
            registry: ClientRegistry::new(),
            transports,
            backends,
        }
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ClientRegistry {
        &mut self.registry
    }

    /// Create a client and make it active. `options` overlay the configured
    /// client defaults.
    pub fn create_client(
        &mut self,
        descriptor: &str,
        alias: Option<&str>,
        options: &ClientOptions,
    ) -> Result<ClientHandle> {
        let options = self.config.client.merged_with(options);
        self.registry.create_client(
            descriptor,
            alias,
            &options,
            self.transports.as_ref(),
            self.backends.as_ref(),
        )
    }

    pub fn close_client(&mut self, alias: Option<&str>) {
        self.registry.close_client(alias);
    }

    pub fn close_all_clients(&mut self) {
        self.registry.close_all_clients();
    }

    pub fn switch_client(&mut self, alias: &str) -> Result<Option<String>> {
        self.registry.switch_client(alias)
    }

    pub fn get_alias(&self, client: Option<ClientHandle>) -> Result<Option<String>> {
        self.registry.get_alias(client)
    }

    pub fn get_client(&self, alias: Option<&str>) -> Result<&SoapClient> {
        self.registry.get_client(alias)
    }

    pub fn get_clients(&self) -> &ClientMap {
        self.registry.get_clients()
    }

    /// Queue a file on the active client.
    pub fn add_attachment(&mut self, source: AttachmentSource<'_>) -> Result<()> {
        let configured = &self.config.multipart.fallback_mimetype;
        let fallback: MimeType = configured.parse().map_err(|_| {
            SoapClientError::Config(format!("Invalid multipart.fallback_mimetype '{configured}'"))
        })?;
        let client = self.registry.active_client_mut()?;
        let attachment = Attachment::load(source, &fallback)?;
        info!(
            client = %client.handle(),
            filename = %attachment.filename,
            mimetype = %attachment.mimetype,
            "Added attachment"
        );
        client.add_attachment(attachment);
        Ok(())
    }

    /// Drop every attachment queued on the active client.
    pub fn clear_attachments(&mut self) -> Result<()> {
        self.registry.active_client_mut()?.clear_attachments();
        Ok(())
    }

    /// Call `operation` on the active client. Unset flags use the configured
    /// defaults.
    pub fn call_operation(
        &self,
        operation: &str,
        xop: Option<bool>,
        debug: Option<bool>,
        args: &OperationArgs,
    ) -> Result<Value> {
        let options = CallOptions {
            xop: xop.unwrap_or(self.config.settings.xop),
            debug: debug.unwrap_or(self.config.settings.debug),
            xop_includes: &self.config.multipart.xop_includes,
        };
        self.registry.active_client()?.call_operation(operation, args, options)
    }

    pub fn create_message(&self, operation: &str, args: &OperationArgs) -> Result<String> {
        self.registry.active_client()?.create_message(operation, args)
    }

    pub fn create_object(&self, type_name: &str, args: &[Value], kwargs: &OperationArgs) -> Result<Value> {
        self.registry
            .active_client()?
            .backend()
            .create_object(type_name, args, kwargs)
    }

    /// Prefix -> namespace URI map of the active client.
    pub fn namespace_prefix_map(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.registry.active_client()?.backend().namespaces())
    }

    pub fn get_namespace_uri(&self, prefix: &str) -> Result<String> {
        self.namespace_prefix_map()?
            .remove(prefix)
            .ok_or_else(|| SoapClientError::NamespacePrefixNotFound(prefix.to_string()))
    }

    pub fn get_namespace_prefix(&self, uri: &str) -> Result<Option<String>> {
        Ok(self
            .namespace_prefix_map()?
            .into_iter()
            .find(|(_, namespace)| namespace == uri)
            .map(|(prefix, _)| prefix))
    }

    pub fn log_namespace_prefix_map(&self, to_log: Option<bool>, to_console: Option<bool>) -> Result<()> {
        let map = self.namespace_prefix_map()?;
        let item = serde_json::to_string_pretty(&map)?;
        self.log(&item, to_log, to_console);
        Ok(())
    }

    pub fn log_opened_clients(&self, to_log: Option<bool>, to_console: Option<bool>) -> Result<()> {
        let item = serde_json::to_string_pretty(&self.clients_summary())?;
        self.log(&item, to_log, to_console);
        Ok(())
    }

    /// Log and return the active client's service description.
    pub fn dump_wsdl(&self) -> Result<String> {
        let description = self.registry.active_client()?.backend().describe();
        log_item(&description, true, false);
        Ok(description)
    }

    fn log(&self, item: &str, to_log: Option<bool>, to_console: Option<bool>) {
        log_item(
            item,
            to_log.unwrap_or(self.config.settings.to_log),
            to_console.unwrap_or(self.config.settings.to_console),
        );
    }

    /// `[{alias, client, descriptor, attachments}]` sorted by alias.
    fn clients_summary(&self) -> Value {
        let mut clients: Vec<(&Option<String>, &SoapClient)> = self.get_clients().iter().collect();
        clients.sort_by(|a, b| a.0.cmp(b.0));
        Value::Array(
            clients
                .into_iter()
                .map(|(alias, client)| {
                    json!({
                        "alias": alias,
                        "client": client.handle().id(),
                        "descriptor": client.descriptor(),
                        "attachments": client.attachments().len(),
                    })
                })
                .collect(),
        )
    }

    /// Run a keyword by name.
    pub fn run_keyword(&mut self, name: &str, args: &[Value], kwargs: &Map<String, Value>) -> Result<Value> {
        let keyword =
            Keyword::from_name(name).ok_or_else(|| SoapClientError::UnknownKeyword(name.to_string()))?;
        debug!(keyword = keyword.name(), args = args.len(), kwargs = kwargs.len(), "Running keyword");

        let call = KeywordArgs::new(keyword, args, kwargs);
        match keyword {
            Keyword::CreateClient => {
                let descriptor = call.required_str(0, "wsdl")?;
                let alias = call.str(1, "alias")?;
                let options = call.client_options()?;
                let handle = self.create_client(descriptor, alias, &options)?;
                Ok(Value::from(handle.id()))
            }
            Keyword::CloseClient => {
                self.close_client(call.str(0, "alias")?);
                Ok(Value::Null)
            }
            Keyword::CloseAllClients => {
                self.close_all_clients();
                Ok(Value::Null)
            }
            Keyword::SwitchClient => {
                let alias = call.required_str(0, "alias")?;
                Ok(json!(self.switch_client(alias)?))
            }
            Keyword::GetAlias => Ok(json!(self.get_alias(call.handle(0, "client")?)?)),
            Keyword::GetClient => {
                let client = self.get_client(call.str(0, "alias")?)?;
                Ok(Value::from(client.handle().id()))
            }
            Keyword::GetClients => Ok(self.clients_summary()),
            Keyword::AddAttachment => {
                let path = call.required_str(0, "file_path")?;
                let source = AttachmentSource {
                    path: Path::new(path),
                    filename: call.str(1, "filename")?,
                    mimetype: call.str(2, "mimetype")?,
                    binary: call.bool(3, "binary")?.unwrap_or(true),
                    http_headers: call.str(4, "http_headers")?.map(str::to_string),
                };
                self.add_attachment(source)?;
                Ok(Value::Null)
            }
            Keyword::ClearAttachments => {
                self.clear_attachments()?;
                Ok(Value::Null)
            }
            Keyword::CallOperation => {
                let operation = call.required_str(0, "operation")?;
                let xop = call.bool(1, "xop")?;
                let debug = call.bool(2, "debug")?;
                let args = call.remaining_named(&["operation", "xop", "debug"]);
                self.call_operation(operation, xop, debug, &args)
            }
            Keyword::CreateMessage => {
                let operation = call.required_str(0, "operation")?;
                let args = call.remaining_named(&["operation"]);
                Ok(Value::String(self.create_message(operation, &args)?))
            }
            Keyword::CreateObject => {
                let type_name = call.required_str(0, "type")?;
                let positional = args.get(1..).unwrap_or_default();
                let fields = call.remaining_named(&["type"]);
                self.create_object(type_name, positional, &fields)
            }
            Keyword::GetNamespaceUri => {
                let prefix = call.required_str(0, "prefix")?;
                Ok(Value::String(self.get_namespace_uri(prefix)?))
            }
            Keyword::GetNamespacePrefix => {
                let uri = call.required_str(0, "uri")?;
                Ok(json!(self.get_namespace_prefix(uri)?))
            }
            Keyword::LogNamespacePrefixMap => {
                self.log_namespace_prefix_map(call.bool(0, "to_log")?, call.bool(1, "to_console")?)?;
                Ok(Value::Null)
            }
            Keyword::LogOpenedClients => {
                self.log_opened_clients(call.bool(0, "to_log")?, call.bool(1, "to_console")?)?;
                Ok(Value::Null)
            }
            Keyword::DumpWsdl => Ok(Value::String(self.dump_wsdl()?)),
        }
    }
}

/// Positional and named arguments of one keyword call.
struct KeywordArgs<'a> {
    keyword: Keyword,
    positional: &'a [Value],
    named: &'a Map<String, Value>,
}

impl<'a> KeywordArgs<'a> {
    fn new(keyword: Keyword, positional: &'a [Value], named: &'a Map<String, Value>) -> Self {
        Self {
            keyword,
            positional,
            named,
        }
    }

    /// Named argument, else the positional one at `index`.
    fn get(&self, index: usize, name: &str) -> Option<&'a Value> {
        self.named
            .get(name)
            .or_else(|| self.positional.get(index))
            .filter(|v| !v.is_null())
    }

    fn invalid(&self, message: String) -> SoapClientError {
        SoapClientError::invalid_argument(self.keyword.name(), message)
    }

    fn str(&self, index: usize, name: &str) -> Result<Option<&'a str>> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(self.invalid(format!("'{name}' must be a string, got {other}"))),
        }
    }

    fn required_str(&self, index: usize, name: &str) -> Result<&'a str> {
        self.str(index, name)?
            .ok_or_else(|| self.invalid(format!("missing required argument '{name}'")))
    }

    /// Booleans, also accepting the strings `true`/`false` in any case.
    fn bool(&self, index: usize, name: &str) -> Result<Option<bool>> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(other) => Err(self.invalid(format!("'{name}' must be a boolean, got {other}"))),
        }
    }

    fn handle(&self, index: usize, name: &str) -> Result<Option<ClientHandle>> {
        match self.get(index, name) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .map(|id| Some(ClientHandle::from_id(id)))
                .ok_or_else(|| self.invalid(format!("'{name}' must be a client id, got {n}"))),
            Some(other) => Err(self.invalid(format!("'{name}' must be a client id, got {other}"))),
        }
    }

    /// Named arguments that are not keyword parameters.
    fn remaining_named(&self, known: &[&str]) -> OperationArgs {
        self.named
            .iter()
            .filter(|(name, _)| !known.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    /// Connection options of `Create client`.
    fn client_options(&self) -> Result<ClientOptions> {
        let auth = match self.get(2, "auth") {
            None => None,
            Some(Value::Array(pair)) => match pair.as_slice() {
                [Value::String(username), Value::String(password)] => Some(BasicAuth {
                    username: username.clone(),
                    password: password.clone(),
                }),
                _ => return Err(self.invalid("'auth' must be [username, password]".to_string())),
            },
            Some(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| self.invalid(format!("invalid 'auth': {e}")))?,
            ),
        };

        let proxies = match self.get(3, "proxies") {
            None => BTreeMap::new(),
            Some(Value::String(url)) => BTreeMap::from([("all".to_string(), url.clone())]),
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| self.invalid(format!("invalid 'proxies': {e}")))?,
        };

        let cert = match self.get(4, "cert") {
            None => None,
            Some(Value::String(path)) => Some(ClientCert {
                cert: path.into(),
                key: None,
            }),
            Some(Value::Array(pair)) => match pair.as_slice() {
                [Value::String(cert), Value::String(key)] => Some(ClientCert {
                    cert: cert.into(),
                    key: Some(key.into()),
                }),
                _ => return Err(self.invalid("'cert' must be a path or [cert, key]".to_string())),
            },
            Some(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| self.invalid(format!("invalid 'cert': {e}")))?,
            ),
        };

        let timeout_secs = match self.get(7, "timeout") {
            None => None,
            Some(value) => Some(
                value
                    .as_u64()
                    .ok_or_else(|| self.invalid(format!("'timeout' must be whole seconds, got {value}")))?,
            ),
        };

        Ok(ClientOptions {
            auth,
            proxies,
            cert,
            verify: self.bool(5, "verify")?,
            ca_bundle: self.str(6, "ca_bundle")?.map(Into::into),
            timeout_secs,
        })
    }
}
