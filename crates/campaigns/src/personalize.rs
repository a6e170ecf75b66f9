//! Message personalization using `{{variable}}` placeholders.

use crm_core::Customer;

/// Placeholders filled from the customer profile.
pub const VARIABLES: &[&str] = &["first_name", "last_name", "full_name", "email"];

fn value_for(name: &str, customer: &Customer) -> String {
    match name {
        "first_name" => customer.first_name.clone(),
        "last_name" => customer.last_name.clone(),
        "full_name" => customer.full_name(),
        "email" => customer.email.clone(),
        _ => String::new(),
    }
}

/// Render a template for one customer. Unknown placeholders are left as is.
pub fn render(template: &str, customer: &Customer) -> String {
    let mut result = template.to_string();
    for name in VARIABLES {
        let placeholder = format!("{{{{{name}}}}}");
        if result.contains(&placeholder) {
            result = result.replace(&placeholder, &value_for(name, customer));
        }
    }
    result
}
