use crate::model::{Hook, UserData};

/// Narrows `user` to what a handler serving `hook` may observe: the hook list
/// shrinks to `hook`, and settings or credentials of services not named by the
/// hook are dropped.
pub fn scope_to_hook(mut user: UserData, hook: &Hook) -> UserData {
    user.hooks.retain(|h| h.token == hook.token);
    user.settings.retain(|service, _| hook.names_service(service));
    user.protected.retain(|service, _| hook.names_service(service));
    user
}
