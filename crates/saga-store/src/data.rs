use common::{Revision, SagaId};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Business state of a saga type.
///
/// Implementors name their saga type and map correlation property names to
/// the current value of that property. The mapping replaces any runtime
/// property lookup: the store only ever asks for the properties the caller
/// passes as correlation properties.
///
/// # Example
///
/// ```
/// use saga_store::SagaData;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct OrderSaga {
///     order_id: String,
///     customer: Option<String>,
/// }
///
/// impl SagaData for OrderSaga {
///     const SAGA_TYPE: &'static str = "OrderSaga";
///
///     fn correlation_value(&self, property: &str) -> Option<String> {
///         match property {
///             "OrderId" => Some(self.order_id.clone()),
///             "Customer" => self.customer.clone(),
///             _ => None,
///         }
///     }
/// }
/// ```
pub trait SagaData: Serialize + DeserializeOwned + Send + Sync {
    /// Type name used in keys, converted to kebab-case when stored.
    const SAGA_TYPE: &'static str;

    /// Returns the value of a correlation property, or `None` when it is
    /// unset. Unset properties are not indexed.
    fn correlation_value(&self, property: &str) -> Option<String>;
}

/// A saga instance together with the revision it was loaded at.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaRecord<T> {
    pub id: SagaId,
    pub revision: Revision,
    pub data: T,
}

impl<T> SagaRecord<T> {
    /// Creates a record that has not been stored yet.
    pub fn new(id: SagaId, data: T) -> Self {
        Self {
            id,
            revision: Revision::initial(),
            data,
        }
    }

    /// Returns true if the record has never been stored.
    pub fn is_new(&self) -> bool {
        self.revision == Revision::initial()
    }
}
