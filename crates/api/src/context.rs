use parley_core::UserId;

/// Caller context for a request (authenticated identity).
///
/// Present on every route behind the auth middleware. Handlers take the
/// caller id from here, never from the request body.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CallerContext {
    user_id: UserId,
}

impl CallerContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }
}
