use crate::machine::Query;
use crate::model::{Nested, Record};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub farm_refs: Vec<u64>,
    #[serde(default)]
    pub user_refs: Vec<u64>,
}

impl Organization {
    pub fn new(name: &str) -> Organization {
        Organization {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

impl Record for Organization {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        self.name.clone()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: u64,
    pub name: String,
}

impl Role {
    pub fn new(name: &str) -> Role {
        Role {
            id: 0,
            name: name.to_string(),
        }
    }
}

impl Record for Role {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        self.name.clone()
    }
}

impl Nested for Role {
    fn entity_id(&self) -> u64 {
        self.id
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: u64,
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub org_id: u64,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub farm_refs: Vec<u64>,
}

impl User {
    pub fn new(email: &str) -> User {
        User {
            email: email.to_string(),
            ..Default::default()
        }
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|role| role.name == name)
    }

    /// Adds a farm reference, returning false if it was already present.
    pub fn add_farm_ref(&mut self, farm_id: u64) -> bool {
        if self.farm_refs.contains(&farm_id) {
            return false;
        }
        self.farm_refs.push(farm_id);
        true
    }
}

impl Record for User {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        self.email.clone()
    }
}

impl Nested for User {
    fn entity_id(&self) -> u64 {
        self.id
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Algorithm {
    pub id: u64,
    pub name: String,
}

impl Algorithm {
    pub fn new(name: &str) -> Algorithm {
        Algorithm {
            id: 0,
            name: name.to_string(),
        }
    }
}

impl Record for Algorithm {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        self.name.clone()
    }
}

/// Billing contact. Customers are stored under their email address rather than their ID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: u64,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub processor_id: String,
}

impl Record for Customer {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        self.email.clone()
    }

    fn query(&self) -> Query {
        Query::key(&self.email)
    }
}

/// Pending sign up awaiting confirmation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub id: u64,
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub org_name: String,
    #[serde(default)]
    pub created_at: u64,
}

impl Record for Registration {
    fn id(&self) -> u64 {
        self.id
    }

    fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    fn identity(&self) -> String {
        format!("{}-{}", self.email, self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_json_is_camel_case() {
        let mut user = User::new("root@localhost");
        user.org_id = 3;
        user.roles.push(Role::new("admin"));
        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["orgId"], 3);
        assert_eq!(json["roles"][0]["name"], "admin");
        assert!(user.has_role("admin"));
    }

    #[test]
    fn farm_refs_are_deduplicated() {
        let mut user = User::new("a@b.c");
        assert!(user.add_farm_ref(9));
        assert!(!user.add_farm_ref(9));
        assert_eq!(user.farm_refs, vec![9]);
    }

    #[test]
    fn customer_is_keyed_by_email() {
        let customer = Customer {
            email: "c@d.e".to_string(),
            ..Default::default()
        };
        assert_eq!(customer.query(), Query::key("c@d.e"));
    }

    #[test]
    fn missing_optional_fields_default() {
        let org: Organization = serde_json::from_str(r#"{"id": 1, "name": "acme"}"#).unwrap();
        assert!(org.farm_refs.is_empty());
    }
}
