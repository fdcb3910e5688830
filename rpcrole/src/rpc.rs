/*!
The role taxonomy and the import-name classifier.

The marker prefixes encode knowledge about the RPC runtime's export
surface, so they are build-time constants rather than runtime options.
Matching is a case-sensitive prefix test against the exact symbol name
from the import table; the runtime exports consistently cased names, so
no normalization happens.
*/

#[cfg(feature = "serde")]
use serde::Serialize;

/// File name of the RPC runtime library searched for among a process's
/// loaded modules. Compared case-insensitively against module base
/// names, which the loader records with inconsistent casing.
pub const RPC_RUNTIME_DLL: &str = "rpcrt4.dll";

/// Prefix of the server-side registration/listen export family. Only
/// processes that stand up an RPC interface import these.
pub const SERVER_IMPORT_PREFIX: &str = "RpcServer";

/// Prefix of the client-side string-binding composition export family.
/// Only processes that construct outbound bindings import these.
pub const CLIENT_IMPORT_PREFIX: &str = "RpcStringBinding";

/// A process's use of the RPC runtime, inferred from declared imports.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "UPPERCASE"))]
pub enum Role {
    None,
    Client,
    Server,
    Both,
}

impl Role {
    /// Classifies an import-name sequence in a single pass.
    ///
    /// Defined for every input: an empty sequence (or one without any
    /// marker) is [`Role::None`].
    pub fn classify<'a, I>(imports: I) -> Role
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut is_client = false;
        let mut is_server = false;

        for name in imports {
            if name.starts_with(SERVER_IMPORT_PREFIX) {
                is_server = true;
            }
            if name.starts_with(CLIENT_IMPORT_PREFIX) {
                is_client = true;
            }
        }

        match (is_client, is_server) {
            (true, true) => Role::Both,
            (true, false) => Role::Client,
            (false, true) => Role::Server,
            (false, false) => Role::None,
        }
    }

    pub fn to_str(self) -> &'static str {
        match self {
            Role::None => "NONE",
            Role::Client => "CLIENT",
            Role::Server => "SERVER",
            Role::Both => "BOTH",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.to_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_imports_are_none() {
        assert_eq!(Role::classify(std::iter::empty::<&str>()), Role::None);
    }

    #[test]
    fn server_marker_alone() {
        assert_eq!(
            Role::classify(["RpcServerListenEx", "Sleep"]),
            Role::Server
        );
    }

    #[test]
    fn client_marker_alone() {
        assert_eq!(Role::classify(["RpcStringBindingComposeA"]), Role::Client);
    }

    #[test]
    fn both_markers() {
        assert_eq!(
            Role::classify(["RpcServerListenEx", "RpcStringBindingComposeA"]),
            Role::Both
        );
    }

    #[test]
    fn unrelated_imports_are_none() {
        assert_eq!(Role::classify(["CreateFileW"]), Role::None);
    }

    #[test]
    fn matching_is_case_sensitive_prefix_only() {
        // lowercased marker and mid-string occurrence both miss
        assert_eq!(
            Role::classify(["rpcserverlisten", "MyRpcServerShim"]),
            Role::None
        );
    }
}
