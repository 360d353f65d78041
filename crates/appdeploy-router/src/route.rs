//! Route definitions
//!
//! A route is built as a value first and rendered to nginx syntax separately,
//! so everything here is testable without touching the filesystem.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker opening the first line of every generated definition
const HEADER_PREFIX: &str = "# appdeploy route:";

/// How an application is exposed through the proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "path")]
pub enum HostingMode {
    /// The application owns the site root
    Direct,
    /// The application lives under a normalized path prefix (no leading or
    /// trailing `/`)
    Subdirectory(String),
}

impl HostingMode {
    /// Externally visible path, always starting and ending with `/`
    pub fn public_path(&self) -> String {
        match self {
            HostingMode::Direct => "/".to_string(),
            HostingMode::Subdirectory(prefix) => format!("/{}/", prefix),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, HostingMode::Direct)
    }
}

impl fmt::Display for HostingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostingMode::Direct => write!(f, "direct"),
            HostingMode::Subdirectory(prefix) => write!(f, "subdirectory /{}", prefix),
        }
    }
}

/// Scheme the proxy uses to reach the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamScheme {
    Http,
    Https,
}

impl UpstreamScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamScheme::Http => "http",
            UpstreamScheme::Https => "https",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "http" => Some(UpstreamScheme::Http),
            "https" => Some(UpstreamScheme::Https),
            _ => None,
        }
    }
}

/// Host-wide settings shared by every route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSettings {
    /// `server_name` of generated server blocks
    pub server_name: String,
    /// Port nginx listens on
    pub listen_port: u16,
    /// Address nginx uses to reach applications
    pub upstream_host: String,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            server_name: "_".to_string(),
            listen_port: 80,
            upstream_host: "127.0.0.1".to_string(),
        }
    }
}

/// A reverse-proxy route for one application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDefinition {
    pub app_name: String,
    /// Name of the definition file; defaults to the application name
    pub site_name: String,
    pub mode: HostingMode,
    pub port: u16,
    pub scheme: UpstreamScheme,
    pub settings: RouteSettings,
}

/// Build the route for an application listening on `port`
pub fn generate_route(
    app_name: &str,
    port: u16,
    mode: HostingMode,
    scheme: UpstreamScheme,
    settings: &RouteSettings,
) -> RouteDefinition {
    RouteDefinition {
        app_name: app_name.to_string(),
        site_name: app_name.to_string(),
        mode,
        port,
        scheme,
        settings: settings.clone(),
    }
}

impl RouteDefinition {
    /// Use an explicit site name instead of the application name
    pub fn with_site_name(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = site_name.into();
        self
    }

    fn upstream(&self) -> String {
        format!(
            "{}://{}:{}",
            self.scheme.as_str(),
            self.settings.upstream_host,
            self.port
        )
    }

    fn header(&self) -> String {
        format!(
            "{} {} {} {} {}",
            HEADER_PREFIX,
            self.app_name,
            self.mode.public_path(),
            self.port,
            self.scheme.as_str()
        )
    }

    fn proxy_directives(&self, indent: &str) -> String {
        let mut lines = vec![
            "proxy_http_version 1.1;".to_string(),
            "proxy_set_header Upgrade $http_upgrade;".to_string(),
            "proxy_set_header Connection keep-alive;".to_string(),
            "proxy_set_header Host $host;".to_string(),
            "proxy_cache_bypass $http_upgrade;".to_string(),
            "proxy_set_header X-Real-IP $remote_addr;".to_string(),
            "proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;".to_string(),
            "proxy_set_header X-Forwarded-Proto $scheme;".to_string(),
        ];

        if let HostingMode::Subdirectory(prefix) = &self.mode {
            lines.push(format!("proxy_set_header X-Forwarded-Prefix /{};", prefix));
        }

        // Applications terminating TLS themselves use locally issued certificates
        if self.scheme == UpstreamScheme::Https {
            lines.push("proxy_ssl_verify off;".to_string());
        }

        lines
            .into_iter()
            .map(|line| format!("{}{}\n", indent, line))
            .collect()
    }

    /// Render the definition in nginx syntax
    pub fn render(&self) -> String {
        match &self.mode {
            HostingMode::Direct => format!(
                "{header}\n\
                 server {{\n    \
                     listen {port} default_server;\n    \
                     listen [::]:{port} default_server;\n    \
                     server_name {server_name};\n\
                 \n    \
                     location / {{\n        \
                         proxy_pass {upstream};\n\
                 {directives}    \
                     }}\n\
                 }}\n",
                header = self.header(),
                port = self.settings.listen_port,
                server_name = self.settings.server_name,
                upstream = self.upstream(),
                directives = self.proxy_directives("        "),
            ),
            // The trailing slash on proxy_pass strips the prefix before forwarding
            HostingMode::Subdirectory(prefix) => format!(
                "{header}\n\
                 location = /{prefix} {{\n    \
                     return 301 /{prefix}/;\n\
                 }}\n\
                 \n\
                 location /{prefix}/ {{\n    \
                     proxy_pass {upstream}/;\n\
                 {directives}\
                 }}\n",
                header = self.header(),
                prefix = prefix,
                upstream = self.upstream(),
                directives = self.proxy_directives("    "),
            ),
        }
    }
}

/// The route an enabled definition describes, recovered from its header line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveRoute {
    pub app_name: String,
    /// Externally visible path (`/` for direct hosting)
    pub path: String,
    pub port: u16,
    pub scheme: UpstreamScheme,
}

impl ActiveRoute {
    /// Parse the header line of a rendered definition
    pub fn parse(definition: &str) -> Option<Self> {
        let header = definition.lines().next()?.strip_prefix(HEADER_PREFIX)?;
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.len() != 4 {
            return None;
        }

        Some(Self {
            app_name: fields[0].to_string(),
            path: fields[1].to_string(),
            port: fields[2].parse().ok()?,
            scheme: UpstreamScheme::parse(fields[3])?,
        })
    }

    pub fn mode(&self) -> HostingMode {
        match self.path.trim_matches('/') {
            "" => HostingMode::Direct,
            prefix => HostingMode::Subdirectory(prefix.to_string()),
        }
    }
}
