//! Thin helpers over `ethers::abi` for call encoding and log decoding

use crate::error::{CoordinatorError, CoordinatorResult};

use ethers::abi::token::{LenientTokenizer, Tokenizer};
use ethers::abi::{Abi, Event, Function, Param, RawLog, StateMutability, Token};
use ethers::types::{Address, Bytes, Log};
use serde::Serialize;

/// Parse a JSON ABI definition
pub fn parse_abi(json: &str) -> CoordinatorResult<Abi> {
    serde_json::from_str(json)
        .map_err(|e| CoordinatorError::InvalidInput(format!("Invalid ABI: {}", e)))
}

/// Whether calling the function leaves chain state untouched
pub fn is_view(function: &Function) -> bool {
    matches!(
        function.state_mutability,
        StateMutability::View | StateMutability::Pure
    )
}

fn tokenize(inputs: &[Param], params: &[String], name: &str) -> CoordinatorResult<Vec<Token>> {
    if params.len() != inputs.len() {
        return Err(CoordinatorError::InvalidInput(format!(
            "Function [{}] expects {} params, got {}",
            name,
            inputs.len(),
            params.len()
        )));
    }

    inputs
        .iter()
        .zip(params)
        .map(|(input, value)| {
            LenientTokenizer::tokenize(&input.kind, value).map_err(|e| {
                CoordinatorError::InvalidInput(format!(
                    "There was a problem encoding param [{}]: {}",
                    input.name, e
                ))
            })
        })
        .collect()
}

/// Tokenize string params against the function inputs and encode the call
pub fn encode_call(function: &Function, params: &[String]) -> CoordinatorResult<Bytes> {
    let tokens = tokenize(&function.inputs, params, &function.name)?;
    function
        .encode_input(&tokens)
        .map(Bytes::from)
        .map_err(|e| CoordinatorError::InvalidInput(format!("Cannot encode call: {}", e)))
}

/// Creation code followed by the encoded constructor arguments
pub fn encode_deploy(abi: &Abi, bytecode: &[u8], params: &[String]) -> CoordinatorResult<Bytes> {
    match &abi.constructor {
        Some(constructor) => {
            let tokens = tokenize(&constructor.inputs, params, "constructor")?;
            constructor
                .encode_input(bytecode.to_vec(), &tokens)
                .map(Bytes::from)
                .map_err(|e| {
                    CoordinatorError::InvalidInput(format!("Cannot encode constructor: {}", e))
                })
        }
        None if params.is_empty() => Ok(Bytes::from(bytecode.to_vec())),
        None => Err(CoordinatorError::InvalidInput(
            "ABI has no constructor but params were given".into(),
        )),
    }
}

/// Decode the return data of a view call
pub fn decode_output(function: &Function, data: &[u8]) -> CoordinatorResult<Vec<Token>> {
    function.decode_output(data).map_err(|e| {
        CoordinatorError::Internal(format!(
            "There was a problem decoding data returned by function [{}]: {}",
            function.name, e
        ))
    })
}

/// A receipt log decoded against a registered ABI
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DecodedEvent {
    pub address: Address,
    pub event_name: String,
    pub event_data: serde_json::Map<String, serde_json::Value>,
}

/// Decode a single log if its first topic matches one of the ABI's events
pub fn decode_log(abi: &Abi, log: &Log) -> Option<DecodedEvent> {
    let topic = log.topics.first()?;
    let event: &Event = abi.events().find(|e| e.signature() == *topic)?;

    let parsed = event
        .parse_log(RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        })
        .ok()?;

    let event_data = parsed
        .params
        .into_iter()
        .map(|p| (p.name, serde_json::Value::String(p.value.to_string())))
        .collect();

    Some(DecodedEvent {
        address: log.address,
        event_name: event.name.clone(),
        event_data,
    })
}
