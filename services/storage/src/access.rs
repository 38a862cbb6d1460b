use crate::acl::{AclPolicy, Permission, Visibility};

/// Decide whether `requester` may exercise `permission` on an object.
///
/// Rules are evaluated in order and the first match wins:
///
/// 1. no policy attached: allow
/// 2. public object and a read: allow
/// 3. anonymous requester: deny
/// 4. requester owns the object: allow
/// 5. otherwise: deny
///
/// Rule 1 leaves an object readable by anyone if the workflow dies between
/// upload and policy attachment.
pub fn can_access(policy: Option<&AclPolicy>, requester: Option<&str>, permission: Permission) -> bool {
    let Some(policy) = policy else {
        return true;
    };

    if policy.visibility == Visibility::Public && permission == Permission::Read {
        return true;
    }

    match requester {
        None => false,
        Some(id) => policy.owner == id,
    }
}
