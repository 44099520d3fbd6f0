//! Identity platform event catalogue.

use crate::registry::{SchemaError, SchemaRegistry};
use crate::{
    EmailChangeRequestedEvent, EmailChangedEvent, EmailVerifiedEvent, PasswordChangedEvent,
    UserDeletedEvent, UserLoggedInEvent, UserProfileUpdatedEvent, UserRegisteredEvent,
};

pub const USER_REGISTERED_V1: &str = "UserRegistered.v1";
pub const USER_LOGGED_IN_V1: &str = "UserLoggedIn.v1";
pub const PASSWORD_CHANGED_V1: &str = "PasswordChanged.v1";
pub const EMAIL_CHANGE_REQUESTED_V1: &str = "EmailChangeRequested.v1";
pub const EMAIL_CHANGED_V1: &str = "EmailChanged.v1";
pub const EMAIL_VERIFIED_V1: &str = "EmailVerified.v1";
pub const USER_PROFILE_UPDATED_V1: &str = "UserProfileUpdated.v1";
pub const USER_DELETED_V1: &str = "UserDeleted.v1";

/// Every tag emitted by the identity and user-profile services.
pub fn identity_event_types() -> &'static [&'static str] {
    &[
        USER_REGISTERED_V1,
        USER_LOGGED_IN_V1,
        PASSWORD_CHANGED_V1,
        EMAIL_CHANGE_REQUESTED_V1,
        EMAIL_CHANGED_V1,
        EMAIL_VERIFIED_V1,
        USER_PROFILE_UPDATED_V1,
        USER_DELETED_V1,
    ]
}

/// Registry with the full identity catalogue.
///
/// Auth events land on `<prefix>.auth.events`, email/verification events on
/// `<prefix>.email.events`, profile events on `<prefix>.user.events`.
pub fn identity_registry(
    topic_prefix: &str,
    source: &str,
) -> Result<SchemaRegistry, SchemaError> {
    let mut registry = SchemaRegistry::new(topic_prefix, source);
    registry
        .register::<UserRegisteredEvent>(USER_REGISTERED_V1, "auth")?
        .register::<UserLoggedInEvent>(USER_LOGGED_IN_V1, "auth")?
        .register::<PasswordChangedEvent>(PASSWORD_CHANGED_V1, "auth")?
        .register::<EmailChangeRequestedEvent>(EMAIL_CHANGE_REQUESTED_V1, "email")?
        .register::<EmailChangedEvent>(EMAIL_CHANGED_V1, "email")?
        .register::<EmailVerifiedEvent>(EMAIL_VERIFIED_V1, "email")?
        .register::<UserProfileUpdatedEvent>(USER_PROFILE_UPDATED_V1, "user")?
        .register::<UserDeletedEvent>(USER_DELETED_V1, "user")?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_is_fully_registered() {
        let registry = identity_registry("identity", "identity-service").unwrap();

        assert_eq!(registry.len(), identity_event_types().len());
        registry.require(identity_event_types()).unwrap();
    }

    #[test]
    fn test_catalogue_topics() {
        let registry = identity_registry("identity", "identity-service").unwrap();

        assert_eq!(
            registry.resolve(USER_REGISTERED_V1).unwrap().topic,
            "identity.auth.events"
        );
        assert_eq!(
            registry.resolve(EMAIL_VERIFIED_V1).unwrap().topic,
            "identity.email.events"
        );
        assert_eq!(
            registry.resolve(USER_DELETED_V1).unwrap().topic,
            "identity.user.events"
        );
    }
}
