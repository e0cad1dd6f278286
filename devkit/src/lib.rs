/*!
# NetVigil DevKit - Builders et utilitaires de test

Bibliothèque partagée par les tests du kernel :
- Builders de payloads au format du collecteur (ping, interface, wireless)
- Attente active sur condition et timeouts explicites pour les tests async
*/

pub mod collector;
pub mod test_utils;

pub use collector::MetricBuilder;
pub use test_utils::{expect_within, init_test_logging, wait_until};
