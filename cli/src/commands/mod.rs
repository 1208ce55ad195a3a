mod helpers;
mod import;
mod progress;
mod tool_state;
mod user;

pub(crate) use import::cmd_import_log;
pub(crate) use progress::{cmd_stats, cmd_weekly};
pub(crate) use tool_state::{cmd_tool_state_reset, cmd_tool_state_show};
pub(crate) use user::{
    cmd_session_issue, cmd_session_revoke, cmd_session_revoke_all, cmd_user_add, cmd_user_list,
    cmd_user_tier,
};
