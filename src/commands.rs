//! TRex command table.
//!
//! Every call is resolved once against this table. The descriptor says
//! whether the request needs the negotiated API handler and whether
//! completion additionally waits for an acknowledgement on the async
//! channel. Unknown names resolve to [`CommandDescriptor::DEFAULT`] so new
//! server commands work without a client update.

/// Which API handler a command must carry in its params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiClass {
    /// Command is valid without an API handler.
    None,
    /// Command carries the `api_h` returned by `api_sync_v2`.
    Core,
}

/// How the client completes a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Completes with the matching response.
    Sync,
    /// Completes with the response and the `trex-barrier` message carrying
    /// the request's `key`.
    Barrier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub api_class: ApiClass,
    pub dispatch: Dispatch,
}

impl CommandDescriptor {
    /// Descriptor applied to names missing from the table.
    pub const DEFAULT: CommandDescriptor = core("");

    /// True when the request must carry `api_h`.
    pub fn needs_api_handler(&self) -> bool {
        self.api_class == ApiClass::Core
    }
}

const fn plain(name: &'static str) -> CommandDescriptor {
    CommandDescriptor {
        name,
        api_class: ApiClass::None,
        dispatch: Dispatch::Sync,
    }
}

const fn core(name: &'static str) -> CommandDescriptor {
    CommandDescriptor {
        name,
        api_class: ApiClass::Core,
        dispatch: Dispatch::Sync,
    }
}

const fn barrier(name: &'static str) -> CommandDescriptor {
    CommandDescriptor {
        name,
        api_class: ApiClass::Core,
        dispatch: Dispatch::Barrier,
    }
}

/// Common and stateless commands.
pub static COMMANDS: &[CommandDescriptor] = &[
    // common
    plain("api_sync"),
    plain("api_sync_v2"),
    plain("get_version"),
    plain("ping"),
    core("get_supported_cmds"),
    core("get_system_info"),
    core("get_utilization"),
    core("get_global_stats"),
    core("get_port_status"),
    core("get_port_stats"),
    core("get_port_xstats_names"),
    core("get_port_xstats_values"),
    core("acquire"),
    core("release"),
    core("set_port_attr"),
    core("service"),
    core("capture"),
    core("set_l2"),
    core("set_l3"),
    core("conf_ipv6"),
    core("get_async_events"),
    barrier("publish_now"),
    // stateless
    core("add_stream"),
    core("add_streams"),
    core("remove_streams"),
    core("remove_all_streams"),
    core("get_stream_list"),
    core("get_all_streams"),
    core("get_stream"),
    core("start_traffic"),
    core("stop_traffic"),
    core("pause_traffic"),
    core("resume_traffic"),
    core("update_traffic"),
    core("validate"),
    core("get_profile_list"),
    core("get_active_pgids"),
    core("get_pgid_stats"),
    core("push_remote"),
];

/// Resolve a method name.
pub fn lookup(method: &str) -> CommandDescriptor {
    // ---
    COMMANDS
        .iter()
        .find(|desc| desc.name == method)
        .copied()
        .unwrap_or(CommandDescriptor::DEFAULT)
}
